//! 上下文层：入站抽取事件、品牌上下文、合并器、线程/Deal 关联

pub mod merger;
pub mod thread;
pub mod types;

pub use merger::{apply_extraction, infer_platform_and_type, ContextMerger};
pub use thread::{DealDirectory, DealRef, DealStatus, InMemoryDealDirectory};
pub use types::{
    BrandContext, Deliverable, ExtractedBrand, ExtractedBudget, ExtractedCampaign,
    ExtractedPayload, InquiryExtracted, Sender,
};
