//! 谈判编排集成测试：合并 → 就绪 → 快照 → 决策 的完整流程

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dealflow::config::AppConfig;
use dealflow::context::{
    DealRef, DealStatus, Deliverable, ExtractedBrand, ExtractedBudget, ExtractedCampaign,
    ExtractedPayload, InMemoryDealDirectory, InquiryExtracted, Sender,
};
use dealflow::core::{DealError, DealEvent, Pipeline};
use dealflow::negotiation::DecisionAction;
use dealflow::rate::{
    BrandDetails, CreatorMetrics, MarketData, MetricsProvider, RateCalculator, RateComputation,
    RateRecommendation, SnapshotStatus,
};
use dealflow::reasoning::DealStage;
use dealflow::store::SqliteStore;

struct FixedMetrics;

#[async_trait]
impl MetricsProvider for FixedMetrics {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn fetch(&self, _: &str, _: Option<&str>) -> Result<CreatorMetrics, DealError> {
        Ok(CreatorMetrics {
            followers: 85_000,
            engagement_rate: 3.8,
            avg_views: Some(22_000),
            posting_frequency: Some(5.0),
            platform: Some("instagram".to_string()),
            content_type: None,
        })
    }
}

struct MarketCalculator {
    market: f64,
    calls: AtomicUsize,
}

impl MarketCalculator {
    fn new(market: f64) -> Arc<Self> {
        Arc::new(Self {
            market,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RateCalculator for MarketCalculator {
    async fn compute(&self, _: &BrandDetails, _: &CreatorMetrics) -> Result<RateComputation, DealError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RateComputation {
            baseline_rate: self.market * 0.8,
            engagement_adjusted_rate: self.market * 0.9,
            reach_adjusted_rate: self.market,
            market_data: Some(MarketData {
                average_rate: Some(self.market),
                min_rate: Some(self.market * 0.7),
                max_rate: Some(self.market * 1.3),
                sample_size: Some(40),
            }),
            recommendation: RateRecommendation {
                recommended_rate: self.market * 1.05,
                min_acceptable: Some(self.market * 0.8),
                rationale: None,
            },
        })
    }
}

struct HangingCalculator;

#[async_trait]
impl RateCalculator for HangingCalculator {
    async fn compute(&self, _: &BrandDetails, _: &CreatorMetrics) -> Result<RateComputation, DealError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(DealError::CalculatorFailed("never".to_string()))
    }
}

fn config(auto_decide: bool) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.negotiation.auto_decide_on_snapshot = auto_decide;
    cfg.rate.calculator_timeout_secs = 1;
    cfg.rate.metrics_timeout_secs = 1;
    cfg
}

fn pipeline(cfg: AppConfig, calculator: Arc<dyn RateCalculator>) -> Pipeline {
    Pipeline::builder(cfg)
        .with_calculator(calculator)
        .with_metrics_provider(Arc::new(FixedMetrics))
        .build()
        .unwrap()
}

fn extraction(inquiry_id: &str, deliverables: Vec<Deliverable>, budget: Option<f64>, platform: Option<&str>) -> InquiryExtracted {
    InquiryExtracted {
        inquiry_id: Some(inquiry_id.to_string()),
        source: "email".to_string(),
        thread_key: None,
        creator_id: Some("creator-1".to_string()),
        sender: Some(Sender {
            name: Some("Priya".to_string()),
            platform: None,
            id: Some("priya@glowco.in".to_string()),
        }),
        extracted: Some(ExtractedPayload {
            brand: None,
            campaign: Some(ExtractedCampaign {
                deliverables: Some(deliverables),
                budget: Some(ExtractedBudget {
                    mentioned: budget.is_some(),
                    amount: budget,
                    currency: None,
                }),
                platform: platform.map(String::from),
                content_type: None,
                timeline: None,
            }),
            urgency: None,
            additional_notes: None,
        }),
    }
}

fn reel() -> Deliverable {
    Deliverable {
        kind: "reel".to_string(),
        count: 1,
        description: None,
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<DealEvent>) -> Vec<&'static str> {
    let mut topics = Vec::new();
    while let Ok(event) = rx.try_recv() {
        topics.push(event.topic());
    }
    topics
}

#[tokio::test]
async fn test_inquiry_counter_scenario() {
    // 默认配置：可接受的开场预算只作为上下文，等品牌正式报价
    let p = pipeline(AppConfig::default(), MarketCalculator::new(20000.0));
    let mut rx = p.subscribe();

    // 第一次抽取：没有交付物与预算 → 上下文建立，未就绪
    let first = p.handle_event(extraction("INQ-1", vec![], None, None)).await;
    assert!(first.context.is_some());
    assert!(!first.readiness.as_ref().unwrap().is_ready);
    assert!(first.snapshot.is_none());
    assert_eq!(drain(&mut rx), vec!["context.updated"]);

    // 第二次抽取：就绪，第 1 轮，生成快照
    let second = p
        .handle_event(extraction("INQ-1", vec![reel()], Some(20000.0), Some("instagram")))
        .await;
    let readiness = second.readiness.unwrap();
    assert!(readiness.triggered);
    assert_eq!(readiness.round, 1);
    let snapshot = second.snapshot.unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Success);
    assert_eq!(snapshot.negotiation_round, 1);
    assert_eq!(snapshot.market_rate(), Some(20000.0));
    assert!(second.decision.is_none());
    assert_eq!(
        drain(&mut rx),
        vec![
            "context.updated",
            "negotiation.evaluation_requested",
            "rate.recommendation_generated"
        ]
    );

    // 品牌还价 15000（市场价的 75%）→ 还价 17500，轮次仍为 1
    let offer = p.record_brand_offer("INQ-1", 15000.0, "Can you do 15k?").await;
    let decided = offer.decision.unwrap();
    assert_eq!(
        decided.decision.action,
        DecisionAction::Counter {
            counter_offer: 17500.0
        }
    );
    assert_eq!(p.readiness("INQ-1").unwrap().negotiation_round, 1);
    assert_eq!(p.latest_snapshot("INQ-1").unwrap().negotiation_round, 1);
    assert_eq!(drain(&mut rx), vec!["negotiation.decided"]);

    let history = p.history("INQ-1");
    assert_eq!(history.len(), 2);
    assert!(history[0].from_brand);
    assert!(!history[1].from_brand);
    assert_eq!(history[1].offer, 17500.0);
}

#[tokio::test]
async fn test_replayed_extraction_triggers_once() {
    let calculator = MarketCalculator::new(20000.0);
    let p = pipeline(config(false), calculator.clone());
    let event = extraction("INQ-2", vec![reel()], Some(20000.0), Some("instagram"));

    let triggers: Vec<bool> = {
        let mut v = Vec::new();
        for _ in 0..4 {
            v.push(p.handle_event(event.clone()).await.readiness.unwrap().triggered);
        }
        v
    };
    assert_eq!(triggers, vec![true, false, false, false]);
    assert_eq!(calculator.calls.load(Ordering::SeqCst), 1);
    assert!(p.snapshot_for_round("INQ-2", 2).is_none());
}

#[tokio::test]
async fn test_force_and_new_fingerprint_increase_rounds() {
    let p = pipeline(config(false), MarketCalculator::new(20000.0));
    p.handle_event(extraction("INQ-3", vec![reel()], Some(20000.0), Some("instagram")))
        .await;

    let forced = p.force_evaluation("INQ-3").await;
    assert_eq!(forced.readiness.unwrap().round, 2);
    assert_eq!(forced.snapshot.unwrap().negotiation_round, 2);

    let revised = p
        .handle_event(extraction("INQ-3", vec![reel()], Some(18000.0), None))
        .await;
    assert_eq!(revised.snapshot.unwrap().negotiation_round, 3);

    let rounds: Vec<u32> = (1..=3)
        .map(|r| p.snapshot_for_round("INQ-3", r).unwrap().negotiation_round)
        .collect();
    assert_eq!(rounds, vec![1, 2, 3]);

    // 未知 inquiry 的 force 不做任何事
    assert!(p.force_evaluation("INQ-missing").await.readiness.is_none());
}

#[tokio::test]
async fn test_calculator_timeout_keeps_audit_trail() {
    let p = pipeline(config(true), Arc::new(HangingCalculator));
    let outcome = p
        .handle_event(extraction("INQ-4", vec![reel()], Some(20000.0), Some("instagram")))
        .await;

    let snapshot = outcome.snapshot.unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::CalculatorFailed);
    assert!(snapshot.payload.is_none());
    assert!(snapshot.error.is_some());
    // 降级快照不自动决策，本轮停滞等待重试
    assert!(outcome.decision.is_none());
    assert!(p.latest_snapshot("INQ-4").is_some());

    // 此时品牌报价只能转人工
    let offer = p.record_brand_offer("INQ-4", 15000.0, "").await;
    assert_eq!(offer.decision.unwrap().decision.action.kind(), "escalate");
}

#[tokio::test]
async fn test_auto_decide_counters_low_opening_budget() {
    let p = pipeline(config(true), MarketCalculator::new(20000.0));
    let outcome = p
        .handle_event(extraction("INQ-5", vec![reel()], Some(14000.0), Some("instagram")))
        .await;
    let opening = outcome.decision.unwrap();
    assert_eq!(
        opening.decision.action,
        DecisionAction::Counter {
            counter_offer: 17000.0
        }
    );
    assert!(p.history("INQ-5")[0].from_brand);

    let accepted = p.record_brand_offer("INQ-5", 18000.0, "Meet at 18k?").await;
    let decided = accepted.decision.unwrap();
    assert_eq!(decided.decision.action, DecisionAction::Accept { amount: 18000.0 });

    let export = p.export_reasoning("INQ-5").unwrap();
    assert_eq!(export["context"]["stage"], "active");

    // 终态后的报价被忽略
    assert!(p.record_brand_offer("INQ-5", 12000.0, "").await.decision.is_none());

    assert!(p.mark_decision_executed("INQ-5", &decided.decision_id).await);
    let export = p.export_reasoning("INQ-5").unwrap();
    assert_eq!(export["context"]["decisions"][1]["executed"], true);
    assert_eq!(export["context"]["decisions"][0]["executed"], false);
}

#[tokio::test]
async fn test_acceptable_budget_is_held_until_brand_offers() {
    let p = pipeline(config(true), MarketCalculator::new(20000.0));
    let outcome = p
        .handle_event(extraction("INQ-5B", vec![reel()], Some(20000.0), Some("instagram")))
        .await;
    assert!(outcome.snapshot.is_some());
    assert!(outcome.decision.is_none());
    assert!(p.history("INQ-5B").is_empty());

    let offer = p.record_brand_offer("INQ-5B", 15000.0, "").await;
    assert_eq!(
        offer.decision.unwrap().decision.action,
        DecisionAction::Counter {
            counter_offer: 17500.0
        }
    );
}

#[tokio::test]
async fn test_round_cap_escalates_after_three_responses() {
    let p = pipeline(config(false), MarketCalculator::new(100.0));
    p.handle_event(extraction("INQ-6", vec![reel()], Some(65.0), Some("instagram")))
        .await;

    let mut actions = Vec::new();
    for offer in [65.0, 66.0, 67.0, 68.0] {
        let outcome = p.record_brand_offer("INQ-6", offer, "").await;
        actions.push(outcome.decision.unwrap().decision.action.kind());
    }
    assert_eq!(actions, vec!["counter", "counter", "counter", "escalate"]);

    let export = p.export_reasoning("INQ-6").unwrap();
    assert_eq!(export["context"]["stage"], DealStage::Escalated.as_str());
    // 之前未执行的还价在新报价到来时都被修正
    assert_eq!(export["context"]["corrections"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_deal_linkage_feeds_brand_name() {
    let directory = Arc::new(InMemoryDealDirectory::new());
    directory.insert(DealRef {
        deal_id: "deal-77".to_string(),
        creator_id: "creator-1".to_string(),
        thread_key: Some("email:priya@glowco.in".to_string()),
        counterpart_id: None,
        brand_name: Some("GlowCo".to_string()),
        status: DealStatus::Negotiating,
    });
    let p = Pipeline::builder(config(false))
        .with_directory(directory)
        .with_calculator(MarketCalculator::new(20000.0))
        .with_metrics_provider(Arc::new(FixedMetrics))
        .build()
        .unwrap();

    let outcome = p
        .handle_event(extraction("INQ-7", vec![reel()], Some(20000.0), Some("instagram")))
        .await;
    assert_eq!(outcome.context.unwrap().deal_id.as_deref(), Some("deal-77"));
    let snapshot = outcome.snapshot.unwrap();
    assert_eq!(snapshot.deal_id.as_deref(), Some("deal-77"));
    assert_eq!(snapshot.brand_details.brand_name, "GlowCo");

    // 明确给出品牌名时优先使用上下文中的
    let mut named = extraction("INQ-7", vec![reel()], Some(19000.0), None);
    if let Some(payload) = named.extracted.as_mut() {
        payload.brand = Some(ExtractedBrand {
            name: Some("GlowCo Naturals".to_string()),
            contact_person: None,
            email: None,
        });
    }
    let outcome = p.handle_event(named).await;
    assert_eq!(outcome.snapshot.unwrap().brand_details.brand_name, "GlowCo Naturals");
}

#[tokio::test]
async fn test_late_deal_link_carries_rounds_forward() {
    let directory = Arc::new(InMemoryDealDirectory::new());
    let p = Pipeline::builder(config(false))
        .with_directory(directory.clone())
        .with_calculator(MarketCalculator::new(100.0))
        .with_metrics_provider(Arc::new(FixedMetrics))
        .build()
        .unwrap();
    let event = extraction("INQ-L", vec![reel()], Some(65.0), Some("instagram"));
    p.handle_event(event.clone()).await;

    for offer in [65.0, 66.0, 67.0] {
        let outcome = p.record_brand_offer("INQ-L", offer, "").await;
        assert_eq!(outcome.decision.unwrap().decision.action.kind(), "counter");
    }
    assert_eq!(p.history("INQ-L").len(), 6);

    // 谈判中途才出现匹配的 deal
    directory.insert(DealRef {
        deal_id: "deal-late".to_string(),
        creator_id: "creator-1".to_string(),
        thread_key: Some("email:priya@glowco.in".to_string()),
        counterpart_id: None,
        brand_name: None,
        status: DealStatus::Negotiating,
    });
    let relinked = p.handle_event(event).await;
    assert_eq!(relinked.context.unwrap().deal_id.as_deref(), Some("deal-late"));
    assert!(!relinked.readiness.unwrap().triggered);

    let history = p.history("INQ-L");
    assert_eq!(history.len(), 6);
    let numbers: Vec<u32> = history.iter().map(|r| r.round).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);

    // 轮次上限仍然生效
    let capped = p.record_brand_offer("INQ-L", 68.0, "").await;
    assert_eq!(capped.decision.unwrap().decision.action.kind(), "escalate");

    let export = p.export_reasoning("INQ-L").unwrap();
    assert_eq!(export["context"]["dealId"], "deal-late");
    assert_eq!(export["context"]["stage"], "escalated");
    assert_eq!(export["context"]["decisions"].as_array().unwrap().len(), 4);
    let facts = export["context"]["keyFacts"].as_array().unwrap();
    assert!(facts.iter().any(|f| f == "adopted_from=INQ-L"));
}

#[tokio::test]
async fn test_sibling_inquiries_share_one_deal_history() {
    let directory = Arc::new(InMemoryDealDirectory::new());
    directory.insert(DealRef {
        deal_id: "deal-1".to_string(),
        creator_id: "creator-1".to_string(),
        thread_key: Some("email:priya@glowco.in".to_string()),
        counterpart_id: None,
        brand_name: Some("GlowCo".to_string()),
        status: DealStatus::Negotiating,
    });
    let p = Arc::new(
        Pipeline::builder(config(false))
            .with_directory(directory)
            .with_calculator(MarketCalculator::new(20000.0))
            .with_metrics_provider(Arc::new(FixedMetrics))
            .build()
            .unwrap(),
    );
    for inquiry in ["INQ-A", "INQ-B"] {
        p.handle_event(extraction(inquiry, vec![reel()], Some(20000.0), Some("instagram")))
            .await;
    }

    let a = {
        let p = Arc::clone(&p);
        tokio::spawn(async move { p.record_brand_offer("INQ-A", 15000.0, "").await })
    };
    let b = {
        let p = Arc::clone(&p);
        tokio::spawn(async move { p.record_brand_offer("INQ-B", 16000.0, "").await })
    };
    assert!(a.await.unwrap().decision.is_some());
    assert!(b.await.unwrap().decision.is_some());

    let history = p.history("INQ-A");
    assert_eq!(history, p.history("INQ-B"));
    let numbers: Vec<u32> = history.iter().map(|r| r.round).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    let mut brand_offers: Vec<f64> = history.iter().filter(|r| r.from_brand).map(|r| r.offer).collect();
    brand_offers.sort_by(|x, y| x.total_cmp(y));
    assert_eq!(brand_offers, vec![15000.0, 16000.0]);
}

#[tokio::test]
async fn test_malformed_input_is_dropped() {
    let p = pipeline(config(false), MarketCalculator::new(100.0));
    assert!(p.handle_raw("not json").await.context.is_none());
    assert!(p.handle_raw(r#"{"source": "email", "extracted": {}}"#).await.context.is_none());
    assert!(p.handle_raw(r#"{"inquiryId": "INQ-8", "source": "email"}"#).await.context.is_none());
    assert!(p.context("INQ-8").is_none());

    let ok = p
        .handle_raw(r#"{"inquiryId": "INQ-8", "source": "email", "extracted": {"campaign": {"deliverables": [{"type": "instagram_reel"}], "budget": {"amount": 5000, "mentioned": true}}}}"#)
        .await;
    let ctx = ok.context.unwrap();
    assert_eq!(ctx.platform.as_deref(), Some("instagram"));
    assert_eq!(ctx.content_type.as_deref(), Some("reel"));
    assert!(ok.readiness.unwrap().triggered);
}

#[tokio::test]
async fn test_concurrent_duplicates_trigger_once_per_inquiry() {
    let calculator = MarketCalculator::new(20000.0);
    let p = Arc::new(pipeline(config(false), calculator.clone()));

    let mut handles = Vec::new();
    for i in 0..20 {
        let p = Arc::clone(&p);
        let inquiry = format!("INQ-C{}", i % 4);
        handles.push(tokio::spawn(async move {
            p.handle_event(extraction(&inquiry, vec![reel()], Some(20000.0), Some("instagram")))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    for i in 0..4 {
        let inquiry = format!("INQ-C{}", i);
        assert_eq!(p.readiness(&inquiry).unwrap().negotiation_round, 1);
    }
    assert_eq!(calculator.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_concurrent_partial_updates_are_both_kept() {
    let calculator = MarketCalculator::new(20000.0);
    let p = Arc::new(pipeline(config(false), calculator.clone()));

    let mut handles = Vec::new();
    for i in 0..8 {
        let inquiry = format!("INQ-P{}", i);
        let deliverables_only = extraction(&inquiry, vec![reel()], None, None);
        let budget_only = extraction(&inquiry, vec![], Some(20000.0), Some("instagram"));
        for event in [deliverables_only, budget_only] {
            let p = Arc::clone(&p);
            handles.push(tokio::spawn(async move { p.handle_event(event).await }));
        }
    }
    for h in handles {
        h.await.unwrap();
    }

    for i in 0..8 {
        let inquiry = format!("INQ-P{}", i);
        let ctx = p.context(&inquiry).unwrap();
        assert_eq!(ctx.deliverables, vec![reel()]);
        assert_eq!(ctx.proposed_budget, Some(20000.0));
        assert_eq!(ctx.platform.as_deref(), Some("instagram"));
        assert_eq!(p.readiness(&inquiry).unwrap().negotiation_round, 1);
    }
    assert_eq!(calculator.calls.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_sqlite_state_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("deals.db");
    let event = extraction("INQ-9", vec![reel()], Some(20000.0), Some("instagram"));

    {
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let p = Pipeline::builder(config(false))
            .with_store(store)
            .with_calculator(MarketCalculator::new(20000.0))
            .with_metrics_provider(Arc::new(FixedMetrics))
            .build()
            .unwrap();
        assert!(p.handle_event(event.clone()).await.readiness.unwrap().triggered);
        p.record_brand_offer("INQ-9", 15000.0, "").await;
    }

    let mut cfg = config(false);
    cfg.app.db_path = Some(db.clone());
    let p = Pipeline::builder(cfg)
        .with_calculator(MarketCalculator::new(20000.0))
        .with_metrics_provider(Arc::new(FixedMetrics))
        .build()
        .unwrap();

    assert_eq!(p.readiness("INQ-9").unwrap().negotiation_round, 1);
    assert!(!p.handle_event(event).await.readiness.unwrap().triggered);
    assert_eq!(p.history("INQ-9").len(), 2);
    assert_eq!(p.latest_snapshot("INQ-9").unwrap().negotiation_round, 1);
}
