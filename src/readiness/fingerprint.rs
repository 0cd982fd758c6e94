//! 上下文指纹：只覆盖影响报价的维度（交付物、预算、平台、内容形式）

use sha2::{Digest, Sha256};

use crate::context::BrandContext;

/// 就绪谓词：交付物非空 且 预算非空 且 (平台 或 内容形式)；是合取，不是打分
pub fn is_negotiation_ready(ctx: &BrandContext) -> bool {
    !ctx.deliverables.is_empty()
        && ctx.proposed_budget.is_some()
        && (ctx.platform.is_some() || ctx.content_type.is_some())
}

/// SHA-256(JSON[deliverables, budget, platform, contentType])，十六进制
///
/// 品牌名、时间戳、联系人等元数据不参与计算。
pub fn context_fingerprint(ctx: &BrandContext) -> String {
    let tuple = (
        &ctx.deliverables,
        ctx.proposed_budget,
        ctx.platform.as_deref(),
        ctx.content_type.as_deref(),
    );
    let canonical = serde_json::to_string(&tuple).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}
