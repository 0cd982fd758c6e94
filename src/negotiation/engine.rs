//! 谈判决策引擎
//!
//! 规则按顺序判定（阈值均为市场档位价的比例）：
//! 1. 报价 >= accept_threshold → 接受
//! 2. 我方回应轮数已达 max_rounds → 按 on_round_cap 接受最高报价或转人工，绝不继续还价
//! 3. 报价 >= counter_floor → 还价（默认取报价与市场价的中点，顾问可给出严格介于两者之间的数额）
//! 4. 低于下限 → 拒绝；最后一轮且仅略低于下限时可转人工
//!
//! 市场价不可用（计算器失败）或没有任何品牌报价时直接转人工。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::config::{NegotiationSection, RoundCapPolicy};
use crate::context::BrandContext;
use crate::core::DealError;
use crate::negotiation::{
    best_brand_offer, latest_brand_offer, our_responses, AdvisorRequest, AdvisorSuggestion, Decision,
    DecisionAction, NegotiationRound, StrategicAdvisor,
};
use crate::rate::{format_deliverables, RateSnapshot};
use crate::reasoning::{DealStage, ReasoningContext, ReasoningManager};

/// 已写入推理日志的决策
#[derive(Debug, Clone)]
pub struct RecordedDecision {
    pub decision_id: String,
    pub decision: Decision,
}

pub struct DecisionEngine {
    cfg: NegotiationSection,
    advisor: Option<Arc<dyn StrategicAdvisor>>,
    advisor_timeout: Duration,
    reasoning: Arc<ReasoningManager>,
}

impl DecisionEngine {
    pub fn new(cfg: NegotiationSection, reasoning: Arc<ReasoningManager>) -> Self {
        Self {
            cfg,
            advisor: None,
            advisor_timeout: Duration::from_secs(15),
            reasoning,
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn StrategicAdvisor>, timeout_secs: u64) -> Self {
        self.advisor = Some(advisor);
        self.advisor_timeout = Duration::from_secs(timeout_secs);
        self
    }

    /// 决策并写入推理日志（含自我修正与阶段迁移）
    ///
    /// deal 已处于终态时返回 None。
    pub async fn decide_and_record(
        &self,
        ctx: &BrandContext,
        snapshot: Option<&RateSnapshot>,
        history: &[NegotiationRound],
    ) -> Result<Option<RecordedDecision>, DealError> {
        let deal_key = ctx.deal_key().to_string();
        let reasoning_ctx = self.reasoning.load(&deal_key)?;
        if reasoning_ctx.stage.is_terminal() {
            tracing::warn!(
                deal_key = %deal_key,
                stage = reasoning_ctx.stage.as_str(),
                "deal already settled, offer ignored"
            );
            return Ok(None);
        }

        let offer = current_offer(ctx, history);
        let market = snapshot.and_then(|s| s.market_rate());
        self.self_correct(&deal_key, &reasoning_ctx, offer, market)?;

        // 只在值变化时追加事实
        let mut facts = Vec::new();
        if let Some(name) = ctx.brand_name.as_deref() {
            facts.push(("brand_name", name.to_string()));
        }
        if let Some(o) = offer {
            facts.push(("latest_offer", format!("{:.2}", o)));
        }
        if let Some(m) = market {
            facts.push(("market_rate", format!("{:.2}", m)));
        }
        let mut facts_added = false;
        for (key, value) in facts {
            if reasoning_ctx.fact(key) != Some(value.as_str()) {
                self.reasoning.add_fact(&deal_key, key, &value)?;
                facts_added = true;
            }
        }
        let reasoning_ctx = if facts_added {
            self.reasoning.load(&deal_key)?
        } else {
            reasoning_ctx
        };

        let decision = self.decide(ctx, snapshot, history, &reasoning_ctx).await;

        let decision_id = self.reasoning.record_decision(
            &deal_key,
            decision.action.kind(),
            &decision.reasoning,
            decision.parameters(),
        )?;
        let mut factors = vec![format!("responses={}", our_responses(history))];
        if let (Some(o), Some(m)) = (offer, market) {
            factors.push(format!("offer_ratio={:.2}", o / m));
        }
        self.reasoning.add_thought(
            &deal_key,
            DealStage::Negotiating,
            &decision.reasoning,
            decision.confidence,
            factors,
        )?;

        if reasoning_ctx.stage == DealStage::Inquiry {
            self.reasoning.advance_stage(&deal_key, DealStage::Negotiating)?;
        }
        let next = match decision.action {
            DecisionAction::Accept { .. } => Some(DealStage::Active),
            DecisionAction::Decline { .. } => Some(DealStage::Declined),
            DecisionAction::Escalate { .. } => Some(DealStage::Escalated),
            DecisionAction::Counter { .. } => None,
        };
        if let Some(stage) = next {
            self.reasoning.advance_stage(&deal_key, stage)?;
        }

        tracing::info!(
            deal_key = %deal_key,
            decision_id = %decision_id,
            action = decision.action.kind(),
            offer = ?decision.offer,
            market_rate = ?decision.market_rate,
            "negotiation decided"
        );
        Ok(Some(RecordedDecision {
            decision_id,
            decision,
        }))
    }

    /// 纯决策：不写任何状态
    pub async fn decide(
        &self,
        ctx: &BrandContext,
        snapshot: Option<&RateSnapshot>,
        history: &[NegotiationRound],
        reasoning: &ReasoningContext,
    ) -> Decision {
        let brand = ctx.brand_name.as_deref().unwrap_or("there");
        let currency = ctx.currency.as_str();

        let Some(market) = snapshot.and_then(|s| s.market_rate()) else {
            return escalate(
                "no usable market rate (rate calculation failed)",
                current_offer(ctx, history),
                None,
            );
        };
        let Some(offer) = current_offer(ctx, history) else {
            return escalate("no brand offer on record", None, Some(market));
        };

        let cfg = &self.cfg;
        let ratio = offer / market;
        let responses = our_responses(history);
        let final_round = responses + 1 >= cfg.max_rounds;

        // 1. 接受
        if offer >= cfg.accept_threshold * market {
            return Decision {
                action: DecisionAction::Accept { amount: offer },
                message: format!(
                    "Hi {}, thanks for the offer. We're happy to confirm at {}. Looking forward to working together!",
                    brand,
                    money(currency, offer)
                ),
                reasoning: format!(
                    "Offer {} is {:.0}% of the market rate {}, at or above the {:.0}% accept threshold.",
                    money(currency, offer),
                    ratio * 100.0,
                    money(currency, market),
                    cfg.accept_threshold * 100.0
                ),
                confidence: confidence_for_accept(ratio, cfg.accept_threshold),
                offer: Some(offer),
                market_rate: Some(market),
            };
        }

        // 2. 轮次上限
        if responses >= cfg.max_rounds {
            return match cfg.on_round_cap {
                RoundCapPolicy::AcceptBest => {
                    let best = best_brand_offer(history).unwrap_or(offer).max(offer);
                    Decision {
                        action: DecisionAction::Accept { amount: best },
                        message: format!(
                            "Hi {}, we'd like to close this out. We can confirm at {}.",
                            brand,
                            money(currency, best)
                        ),
                        reasoning: format!(
                            "Round cap of {} responses reached; accepting the best brand offer so far ({}).",
                            cfg.max_rounds,
                            money(currency, best)
                        ),
                        confidence: 55,
                        offer: Some(offer),
                        market_rate: Some(market),
                    }
                }
                RoundCapPolicy::Escalate => escalate(
                    &format!(
                        "round cap of {} responses reached without agreement (latest offer {:.0}% of market)",
                        cfg.max_rounds,
                        ratio * 100.0
                    ),
                    Some(offer),
                    Some(market),
                ),
            };
        }

        // 3. 中间带还价
        if offer >= cfg.counter_floor * market {
            let midpoint = round2((offer + market) / 2.0);
            let suggestion = self
                .consult(ctx, history, reasoning, offer, market, "counter", Some(midpoint))
                .await;

            let (counter, reasoning_text, confidence) = match &suggestion {
                Some(s @ AdvisorSuggestion::Counter { amount, .. })
                    if *amount > offer && *amount < market =>
                {
                    (round2(*amount), s.reasoning().to_string(), s.confidence())
                }
                Some(s) => (
                    midpoint,
                    format!(
                        "{} {}",
                        counter_reasoning(currency, offer, market, ratio),
                        s.reasoning()
                    ),
                    s.confidence(),
                ),
                None => (
                    midpoint,
                    counter_reasoning(currency, offer, market, ratio),
                    confidence_for_counter(ratio, cfg.counter_floor, cfg.accept_threshold),
                ),
            };

            return Decision {
                action: DecisionAction::Counter {
                    counter_offer: counter,
                },
                message: format!(
                    "Hi {}, thanks for the offer of {}. Based on current rates for {}, we'd propose {}.",
                    brand,
                    money(currency, offer),
                    deliverables_or_scope(ctx),
                    money(currency, counter)
                ),
                reasoning: reasoning_text,
                confidence,
                offer: Some(offer),
                market_rate: Some(market),
            };
        }

        // 4. 低于下限
        let borderline = offer >= (cfg.counter_floor - cfg.borderline_margin) * market;
        let escalate_instead = cfg.escalate_borderline_on_final && final_round && borderline;
        let proposed = if escalate_instead { "escalate" } else { "decline" };
        let suggestion = self
            .consult(ctx, history, reasoning, offer, market, proposed, None)
            .await;

        let base_reason = format!(
            "Offer {} is {:.0}% of the market rate {}, below the {:.0}% floor.",
            money(currency, offer),
            ratio * 100.0,
            money(currency, market),
            cfg.counter_floor * 100.0
        );
        let (reasoning_text, advisor_confidence) = match &suggestion {
            Some(s) => (format!("{} {}", base_reason, s.reasoning()), Some(s.confidence())),
            None => (base_reason.clone(), None),
        };

        if escalate_instead {
            let mut d = escalate(
                &format!("final round and offer is borderline: {}", base_reason),
                Some(offer),
                Some(market),
            );
            d.reasoning = reasoning_text;
            if let Some(c) = advisor_confidence {
                d.confidence = c;
            }
            return d;
        }

        Decision {
            action: DecisionAction::Decline { reason: base_reason },
            message: format!(
                "Hi {}, thank you for considering us. Unfortunately {} is below what we can accept for this scope.",
                brand,
                money(currency, offer)
            ),
            reasoning: reasoning_text,
            confidence: advisor_confidence.unwrap_or(80),
            offer: Some(offer),
            market_rate: Some(market),
        }
    }

    /// 咨询顾问；未配置 / 超时 / 出错 / 不合法都返回 None
    #[allow(clippy::too_many_arguments)]
    async fn consult(
        &self,
        ctx: &BrandContext,
        history: &[NegotiationRound],
        reasoning: &ReasoningContext,
        offer: f64,
        market: f64,
        proposed_action: &str,
        deterministic_counter: Option<f64>,
    ) -> Option<AdvisorSuggestion> {
        let advisor = self.advisor.as_ref()?;
        let request = AdvisorRequest {
            deal_key: ctx.deal_key().to_string(),
            brand_name: ctx.brand_name.clone(),
            currency: ctx.currency.clone(),
            deliverables: format_deliverables(&ctx.deliverables),
            offer,
            market_rate: market,
            offer_ratio: round2(offer / market),
            proposed_action: proposed_action.to_string(),
            deterministic_counter,
            responses_so_far: our_responses(history),
            max_rounds: self.cfg.max_rounds,
            history: history.to_vec(),
            key_facts: reasoning.key_facts.clone(),
            recent_thoughts: reasoning.recent_thoughts(5),
        };
        match timeout(self.advisor_timeout, advisor.advise(&request)).await {
            Ok(Ok(s)) => Some(s),
            Ok(Err(e)) => {
                tracing::warn!(deal_key = %request.deal_key, error = %e, "advisor failed, using deterministic rules");
                None
            }
            Err(_) => {
                tracing::warn!(
                    deal_key = %request.deal_key,
                    secs = self.advisor_timeout.as_secs(),
                    "advisor timed out, using deterministic rules"
                );
                None
            }
        }
    }

    /// 对尚未执行、且所依据的报价或市场价已变化的决策追加修正记录
    fn self_correct(
        &self,
        deal_key: &str,
        reasoning: &ReasoningContext,
        offer: Option<f64>,
        market: Option<f64>,
    ) -> Result<(), DealError> {
        for d in reasoning.pending_decisions() {
            let tag = format!("[{}]", d.id);
            if reasoning
                .corrections
                .iter()
                .any(|c| c.original_thought.starts_with(&tag))
            {
                continue;
            }
            let offer_changed = differs(d.offer(), offer);
            let market_changed = differs(d.market_rate(), market);
            if !offer_changed && !market_changed {
                continue;
            }
            let trigger = if offer_changed { "brand_offer" } else { "rate_snapshot" };
            self.reasoning.record_correction(
                deal_key,
                &format!("{} {}", tag, d.reasoning),
                &format!(
                    "inputs changed before execution: offer {} -> {}, market {} -> {}",
                    fmt_opt(d.offer()),
                    fmt_opt(offer),
                    fmt_opt(d.market_rate()),
                    fmt_opt(market)
                ),
                "decision was not executed and its inputs are stale",
                trigger,
            )?;
        }
        Ok(())
    }
}

/// 最近的品牌报价，没有则用上下文中的预算
fn current_offer(ctx: &BrandContext, history: &[NegotiationRound]) -> Option<f64> {
    latest_brand_offer(history).or(ctx.proposed_budget)
}

fn escalate(reason: &str, offer: Option<f64>, market: Option<f64>) -> Decision {
    Decision {
        action: DecisionAction::Escalate {
            reason: reason.to_string(),
        },
        message: "Thanks for your patience, we'll get back to you shortly.".to_string(),
        reasoning: format!("Escalated to a human: {}.", reason),
        confidence: 50,
        offer,
        market_rate: market,
    }
}

fn counter_reasoning(currency: &str, offer: f64, market: f64, ratio: f64) -> String {
    format!(
        "Offer {} is {:.0}% of the market rate {}, inside the counter band; countering at the midpoint.",
        money(currency, offer),
        ratio * 100.0,
        money(currency, market)
    )
}

fn deliverables_or_scope(ctx: &BrandContext) -> String {
    let s = format_deliverables(&ctx.deliverables);
    if s.is_empty() {
        "this scope".to_string()
    } else {
        s
    }
}

fn confidence_for_accept(ratio: f64, threshold: f64) -> u8 {
    (80.0 + (ratio - threshold) * 100.0).clamp(80.0, 95.0) as u8
}

fn confidence_for_counter(ratio: f64, floor: f64, accept: f64) -> u8 {
    let span = (accept - floor).max(f64::EPSILON);
    (55.0 + (ratio - floor) / span * 25.0).clamp(55.0, 80.0) as u8
}

fn differs(recorded: Option<f64>, current: Option<f64>) -> bool {
    match (recorded, current) {
        (Some(a), Some(b)) => (a - b).abs() > 0.005,
        (None, None) => false,
        _ => true,
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{}", x)).unwrap_or_else(|| "none".to_string())
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn money(currency: &str, amount: f64) -> String {
    if amount.fract().abs() < f64::EPSILON {
        format!("{} {:.0}", currency, amount)
    } else {
        format!("{} {:.2}", currency, amount)
    }
}
