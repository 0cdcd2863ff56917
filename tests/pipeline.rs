use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::Utc;
use rust_decimal::Decimal;
use tempfile::TempDir;

use siefore_update::{
    Afore, ApprovalGate, ApprovalState, Collaborators, Concept, ConsistencyReport, DocumentSource,
    Fund, FxRate, FxSource, HistoricalStore, HistorySource, IntegrationResult, Notifier, Period,
    Pipeline, PipelineError, RawDocument, RawRow, ReviewSummary, RunOptions, RunOutcome,
    SieforeRecord, Stage, StoreHistorySource,
};

// ============================================================================
// FAKE COLLABORATORS
// ============================================================================

struct FakeDocuments {
    latest: String,
    downloads: Rc<Cell<usize>>,
    fail_all: bool,
}

impl DocumentSource for FakeDocuments {
    fn fetch_latest_period(&self) -> anyhow::Result<String> {
        Ok(self.latest.clone())
    }

    fn fetch_document(&self, fund: Fund, _period: Period) -> anyhow::Result<RawDocument> {
        self.downloads.set(self.downloads.get() + 1);
        if self.fail_all {
            return Err(anyhow!("portal unreachable"));
        }
        if fund != Fund::Pensiones {
            return Ok(RawDocument::new(vec![]));
        }
        Ok(RawDocument::new(vec![
            row("oct-2025", "XXI Banorte", "Total de Activo", "31,000,000"),
            row("nov-2025", "XXI Banorte", "Total de Activo", "31,319,202.025"),
            row("nov-2025", "Azteca", "Total de Activo", "0"),
            row("nov-2025", "Azteca", "Inversión en Fondos Mutuos", "N/E"),
            row("nov-2025", "Total", "Total de Activo", "31,319,202.025"),
        ]))
    }
}

fn row(period: &str, afore: &str, concept: &str, value: &str) -> RawRow {
    RawRow {
        period: period.to_string(),
        afore: afore.to_string(),
        concept: concept.to_string(),
        value: value.to_string(),
        line_number: 0,
    }
}

struct FixedHistory(Option<String>);

impl HistorySource for FixedHistory {
    fn fetch_latest_integrated_period(&self) -> anyhow::Result<Option<String>> {
        Ok(self.0.clone())
    }
}

struct FakeFx {
    rate: Option<&'static str>,
    calls: Rc<Cell<usize>>,
}

impl FxSource for FakeFx {
    fn fetch_rate(&self, period: Period) -> anyhow::Result<Option<FxRate>> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.rate.map(|rate| FxRate {
            period,
            rate_value: Decimal::from_str(rate).unwrap(),
            source_timestamp: Utc::now(),
        }))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    log: Rc<RefCell<Vec<String>>>,
    fail_approved: bool,
}

impl Notifier for RecordingNotifier {
    fn pending(
        &self,
        period: Period,
        records: &[SieforeRecord],
        _summary: &ReviewSummary,
        _consistency: Option<&ConsistencyReport>,
    ) -> anyhow::Result<()> {
        self.log
            .borrow_mut()
            .push(format!("pending {} {}", period, records.len()));
        Ok(())
    }

    fn approved(&self, period: Period, result: &IntegrationResult) -> anyhow::Result<()> {
        if self.fail_approved {
            return Err(anyhow!("mail relay down"));
        }
        self.log
            .borrow_mut()
            .push(format!("approved {} {}", period, result.added));
        Ok(())
    }

    fn rejected(&self, period: Period) -> anyhow::Result<()> {
        self.log.borrow_mut().push(format!("rejected {}", period));
        Ok(())
    }
}

// ============================================================================
// HARNESS
// ============================================================================

struct Harness {
    dir: TempDir,
    downloads: Rc<Cell<usize>>,
    fx_calls: Rc<Cell<usize>>,
    notifications: Rc<RefCell<Vec<String>>>,
    notifier_fails: Cell<bool>,
}

impl Harness {
    fn new() -> Self {
        Harness {
            dir: TempDir::new().unwrap(),
            downloads: Rc::new(Cell::new(0)),
            fx_calls: Rc::new(Cell::new(0)),
            notifications: Rc::new(RefCell::new(Vec::new())),
            notifier_fails: Cell::new(false),
        }
    }

    fn store(&self) -> HistoricalStore {
        HistoricalStore::open(self.dir.path().join("history.db"), self.dir.path().join("backups")).unwrap()
    }

    fn pipeline(&self, latest: &str, history: Option<&str>, rate: Option<&'static str>) -> Pipeline {
        self.build(latest, Box::new(FixedHistory(history.map(String::from))), rate, false)
    }

    /// History answered by the store itself, as in production
    fn live_pipeline(&self, latest: &str) -> Pipeline {
        self.build(latest, Box::new(StoreHistorySource::new(self.store())), Some("18.5725"), false)
    }

    fn build(
        &self,
        latest: &str,
        history: Box<dyn HistorySource>,
        rate: Option<&'static str>,
        fail_downloads: bool,
    ) -> Pipeline {
        let collaborators = Collaborators {
            documents: Box::new(FakeDocuments {
                latest: latest.to_string(),
                downloads: Rc::clone(&self.downloads),
                fail_all: fail_downloads,
            }),
            history,
            fx: Box::new(FakeFx {
                rate,
                calls: Rc::clone(&self.fx_calls),
            }),
            notifier: Box::new(RecordingNotifier {
                log: Rc::clone(&self.notifications),
                fail_approved: self.notifier_fails.get(),
            }),
        };
        let gate = ApprovalGate::open(&self.dir.path().join("state.db")).unwrap();
        Pipeline::new(collaborators, gate, self.store())
    }
}

fn nov() -> Period {
    Period::new(2025, 11).unwrap()
}

/// Drop one record from the staged batch behind the gate's back
fn tamper_with_staged_batch(h: &Harness, period: Period) {
    let conn = rusqlite::Connection::open(h.dir.path().join("state.db")).unwrap();
    let json: String = conn
        .query_row(
            "SELECT batch FROM staged_batches WHERE period = ?1",
            [period.to_string()],
            |row| row.get(0),
        )
        .unwrap();
    let mut batch: serde_json::Value = serde_json::from_str(&json).unwrap();
    batch["records"].as_array_mut().unwrap().pop();
    conn.execute(
        "UPDATE staged_batches SET batch = ?1 WHERE period = ?2",
        [batch.to_string(), period.to_string()],
    )
    .unwrap();
}

// ============================================================================
// TESTS
// ============================================================================

#[test]
fn test_same_period_short_circuits_without_download() {
    let h = Harness::new();
    let mut pipeline = h.pipeline("2025.10", Some("v2025.10"), Some("18.5725"));

    let outcome = pipeline.run(RunOptions::default()).unwrap();

    assert!(matches!(outcome, RunOutcome::UpToDate { .. }));
    assert_eq!(h.downloads.get(), 0);
    assert_eq!(h.fx_calls.get(), 0);
    assert!(h.notifications.borrow().is_empty());
}

#[test]
fn test_newer_period_goes_to_review() {
    let h = Harness::new();
    let mut pipeline = h.pipeline("Periodo disponible: Ene 19-Nov 25", Some("v2025.10"), Some("18.5725"));

    let outcome = pipeline.run(RunOptions::default()).unwrap();

    let RunOutcome::AwaitingApproval { status, summary, .. } = outcome else {
        panic!("expected a pending review");
    };
    assert_eq!(status.period, nov());
    assert_eq!(status.state, ApprovalState::Pending);
    assert_eq!(status.revision, 1);
    // Banorte and Azteca Total Assets; N/E and the Total row are dropped
    assert_eq!(status.record_count, 2);
    assert_eq!(summary.non_zero_count, 1);
    assert_eq!(h.downloads.get(), Fund::ALL.len());
    assert_eq!(*h.notifications.borrow(), vec!["pending 2025.11 2".to_string()]);

    // Nothing reaches the history before approval
    assert_eq!(h.store().count().unwrap(), 0);
}

#[test]
fn test_unparsable_source_period_stops_before_download() {
    let h = Harness::new();
    let mut pipeline = h.pipeline("próximamente", None, Some("18.5725"));

    let failure = pipeline.run(RunOptions::default()).unwrap_err();

    assert_eq!(failure.stage, Stage::DetectPeriod);
    assert!(matches!(failure.source, PipelineError::Format(_)));
    assert_eq!(h.downloads.get(), 0);
}

#[test]
fn test_missing_rate_stops_at_enrich() {
    let h = Harness::new();
    let mut pipeline = h.pipeline("2025.11", Some("2025.10"), None);

    let failure = pipeline.run(RunOptions::default()).unwrap_err();

    assert_eq!(failure.stage, Stage::Enrich);
    assert!(matches!(failure.source, PipelineError::MissingRate(p) if p == nov()));
    assert!(pipeline.gate().current(nov()).unwrap().is_none());
}

#[test]
fn test_all_downloads_failing_is_a_download_failure() {
    let h = Harness::new();
    let mut pipeline = h.build(
        "2025.11",
        Box::new(FixedHistory(Some("2025.10".to_string()))),
        Some("18.5725"),
        true,
    );

    let failure = pipeline.run(RunOptions::default()).unwrap_err();

    assert_eq!(failure.stage, Stage::Download);
    assert!(failure.to_string().contains("portal unreachable"));
}

#[test]
fn test_pending_period_cannot_be_integrated() {
    let h = Harness::new();
    let mut pipeline = h.pipeline("2025.11", Some("2025.10"), Some("18.5725"));
    pipeline.run(RunOptions::default()).unwrap();

    let failure = pipeline.integrate(nov()).unwrap_err();

    assert_eq!(failure.stage, Stage::Integrate);
    assert!(matches!(
        failure.source,
        PipelineError::NotApproved { state: ApprovalState::Pending, .. }
    ));
    assert_eq!(h.store().count().unwrap(), 0);
    assert!(!h.dir.path().join("backups").exists());
}

#[test]
fn test_approve_then_integrate_writes_store_units() {
    let h = Harness::new();
    let mut pipeline = h.live_pipeline("2025.11");
    pipeline.run(RunOptions::default()).unwrap();

    let approved = pipeline.approve(nov()).unwrap();
    assert_eq!(approved.state, ApprovalState::Approved);

    let result = pipeline.integrate(nov()).unwrap();
    assert_eq!(result.removed, 0);
    assert_eq!(result.added, 2);
    assert_eq!(result.store_size, 2);
    assert!(result.backup_path.exists());

    let stored = h.store().records_for_period(nov()).unwrap();
    let banorte = stored
        .iter()
        .find(|r| r.afore == Afore::XxiBanorte && r.concept == Concept::TotalAssets)
        .unwrap();
    assert_eq!(banorte.value_mxn, Decimal::from(31_319_202_025i64));
    let usd = banorte.value_usd.unwrap();
    assert!((usd - Decimal::from_str("1686321282.81").unwrap()).abs() < Decimal::from_str("0.01").unwrap());
    assert!(banorte.is_normalized());

    let azteca = stored.iter().find(|r| r.afore == Afore::Azteca).unwrap();
    assert_eq!(azteca.value_usd, Some(Decimal::ZERO));

    assert!(h.notifications.borrow().contains(&"approved 2025.11 2".to_string()));

    // The history now has the period, so the next run has nothing to do
    let mut next = h.live_pipeline("2025.11");
    let downloads_before = h.downloads.get();
    assert!(matches!(next.run(RunOptions::default()).unwrap(), RunOutcome::UpToDate { .. }));
    assert_eq!(h.downloads.get(), downloads_before);
}

#[test]
fn test_integrating_twice_keeps_store_size() {
    let h = Harness::new();
    let mut pipeline = h.pipeline("2025.11", Some("2025.10"), Some("18.5725"));
    pipeline.run(RunOptions::default()).unwrap();
    pipeline.approve(nov()).unwrap();

    let first = pipeline.integrate(nov()).unwrap();
    let second = pipeline.integrate(nov()).unwrap();

    assert_eq!(second.removed, first.added);
    assert_eq!(second.store_size, first.store_size);
}

#[test]
fn test_decided_period_is_skipped_unless_forced() {
    let h = Harness::new();
    let mut pipeline = h.pipeline("2025.11", Some("2025.10"), Some("18.5725"));
    pipeline.run(RunOptions::default()).unwrap();
    pipeline.reject(nov()).unwrap();
    assert!(h.notifications.borrow().contains(&"rejected 2025.11".to_string()));

    let downloads = h.downloads.get();
    let outcome = pipeline.run(RunOptions::default()).unwrap();
    let RunOutcome::AlreadyDecided { status } = outcome else {
        panic!("expected the rejected period to be skipped");
    };
    assert_eq!(status.state, ApprovalState::Rejected);
    assert_eq!(h.downloads.get(), downloads);

    // Deciding again is refused
    let failure = pipeline.approve(nov()).unwrap_err();
    assert_eq!(failure.stage, Stage::Approve);
    assert!(matches!(failure.source, PipelineError::AlreadyDecided { .. }));

    let outcome = pipeline
        .run(RunOptions {
            force_rereview: true,
        })
        .unwrap();
    let RunOutcome::AwaitingApproval { status, .. } = outcome else {
        panic!("expected a new review");
    };
    assert_eq!(status.revision, 2);
    assert_eq!(status.state, ApprovalState::Pending);

    let history = pipeline.gate().history(nov()).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].state, ApprovalState::Rejected);
}

#[test]
fn test_events_trace_the_review() {
    let h = Harness::new();
    let mut pipeline = h.pipeline("2025.11", Some("2025.10"), Some("18.5725"));
    pipeline.run(RunOptions::default()).unwrap();
    pipeline.approve(nov()).unwrap();
    pipeline.integrate(nov()).unwrap();

    let events = pipeline.gate().events_for_period(nov()).unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    // Newest first
    assert_eq!(types, vec!["integrated", "review_decided", "review_opened"]);
}

#[test]
fn test_rejected_period_cannot_be_integrated() {
    let h = Harness::new();
    let mut pipeline = h.pipeline("2025.11", Some("2025.10"), Some("18.5725"));
    pipeline.run(RunOptions::default()).unwrap();
    pipeline.reject(nov()).unwrap();

    let failure = pipeline.integrate(nov()).unwrap_err();

    assert_eq!(failure.stage, Stage::Integrate);
    assert!(matches!(
        failure.source,
        PipelineError::NotApproved { state: ApprovalState::Rejected, .. }
    ));
    assert_eq!(h.store().count().unwrap(), 0);
    assert!(!h.dir.path().join("backups").exists());
}

#[test]
fn test_batch_changed_after_approval_is_refused() {
    let h = Harness::new();
    let mut pipeline = h.pipeline("2025.11", Some("2025.10"), Some("18.5725"));
    pipeline.run(RunOptions::default()).unwrap();
    pipeline.approve(nov()).unwrap();

    tamper_with_staged_batch(&h, nov());
    let failure = pipeline.integrate(nov()).unwrap_err();

    assert_eq!(failure.stage, Stage::Integrate);
    assert!(matches!(failure.source, PipelineError::DigestMismatch(p) if p == nov()));
    assert_eq!(h.store().count().unwrap(), 0);
    assert!(!h.dir.path().join("backups").exists());
}

#[test]
fn test_failed_notice_after_commit_still_reports_success() {
    let h = Harness::new();
    h.notifier_fails.set(true);
    let mut pipeline = h.pipeline("2025.11", Some("2025.10"), Some("18.5725"));
    pipeline.run(RunOptions::default()).unwrap();
    pipeline.approve(nov()).unwrap();

    let result = pipeline.integrate(nov()).unwrap();

    assert_eq!(result.added, 2);
    assert_eq!(h.store().count().unwrap(), 2);
    assert!(!h.notifications.borrow().iter().any(|n| n.starts_with("approved")));
    let events = pipeline.gate().events_for_period(nov()).unwrap();
    assert_eq!(events[0].event_type, "integrated");
}
