//! 谈判历史：每个 deal 一个有序轮次列表，轮次号严格递增

use std::sync::Arc;

use chrono::Utc;

use crate::core::DealError;
use crate::negotiation::NegotiationRound;
use crate::store::{KvStore, Namespace};

const APPEND_RETRIES: usize = 3;

pub struct NegotiationHistory {
    store: Arc<dyn KvStore>,
}

impl NegotiationHistory {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, deal_key: &str) -> Result<Vec<NegotiationRound>, DealError> {
        Ok(self.read(deal_key)?.1)
    }

    /// 追加一轮，轮次号 = 上一轮 + 1
    ///
    /// 同一 deal 可能被多个 inquiry 共享，CAS 冲突时重新读取后重试。
    pub fn append(
        &self,
        deal_key: &str,
        from_brand: bool,
        offer: f64,
        message: &str,
        reasoning: Option<String>,
    ) -> Result<NegotiationRound, DealError> {
        if !offer.is_finite() || offer < 0.0 {
            return Err(DealError::MalformedInput(format!("invalid offer amount {}", offer)));
        }
        for _ in 0..APPEND_RETRIES {
            let (raw_prior, mut rounds) = self.read(deal_key)?;
            let round = NegotiationRound {
                round: rounds.last().map(|r| r.round + 1).unwrap_or(1),
                timestamp: Utc::now(),
                from_brand,
                offer,
                message: message.to_string(),
                reasoning: reasoning.clone(),
            };
            rounds.push(round.clone());

            let raw = serde_json::to_string(&rounds)?;
            if self.store.compare_and_swap(
                Namespace::NegotiationRounds,
                deal_key,
                raw_prior.as_deref(),
                &raw,
            )? {
                tracing::debug!(deal_key, round = round.round, from_brand, offer, "negotiation round appended");
                return Ok(round);
            }
            tracing::debug!(deal_key, "negotiation append raced, retrying");
        }
        Err(DealError::WriteConflict {
            namespace: Namespace::NegotiationRounds.as_str().to_string(),
            key: deal_key.to_string(),
        })
    }

    /// 把 `from` 下的轮次按原顺序接到 `to` 之后（轮次号顺延），随后删除 `from`
    ///
    /// 返回迁移的轮数；`from` 为空时什么都不做。
    pub fn adopt(&self, from: &str, to: &str) -> Result<usize, DealError> {
        let (_, moved) = self.read(from)?;
        if moved.is_empty() || from == to {
            return Ok(0);
        }
        for _ in 0..APPEND_RETRIES {
            let (raw_prior, mut rounds) = self.read(to)?;
            let mut next = rounds.last().map(|r| r.round + 1).unwrap_or(1);
            for r in &moved {
                rounds.push(NegotiationRound {
                    round: next,
                    ..r.clone()
                });
                next += 1;
            }
            let raw = serde_json::to_string(&rounds)?;
            if self.store.compare_and_swap(
                Namespace::NegotiationRounds,
                to,
                raw_prior.as_deref(),
                &raw,
            )? {
                self.store.delete(Namespace::NegotiationRounds, from)?;
                tracing::info!(from, to, rounds = moved.len(), "negotiation history moved to deal");
                return Ok(moved.len());
            }
        }
        Err(DealError::WriteConflict {
            namespace: Namespace::NegotiationRounds.as_str().to_string(),
            key: to.to_string(),
        })
    }

    fn read(&self, deal_key: &str) -> Result<(Option<String>, Vec<NegotiationRound>), DealError> {
        match self.store.get(Namespace::NegotiationRounds, deal_key)? {
            Some(raw) => {
                let rounds = serde_json::from_str(&raw)?;
                Ok((Some(raw), rounds))
            }
            None => Ok((None, Vec::new())),
        }
    }
}

/// 最近一次品牌报价
pub fn latest_brand_offer(history: &[NegotiationRound]) -> Option<f64> {
    history.iter().rev().find(|r| r.from_brand).map(|r| r.offer)
}

/// 迄今品牌最高报价
pub fn best_brand_offer(history: &[NegotiationRound]) -> Option<f64> {
    history
        .iter()
        .filter(|r| r.from_brand)
        .map(|r| r.offer)
        .fold(None, |best: Option<f64>, o| Some(best.map_or(o, |b| b.max(o))))
}

/// 我方已回应的轮数
pub fn our_responses(history: &[NegotiationRound]) -> u32 {
    history.iter().filter(|r| !r.from_brand).count() as u32
}
