//! End-to-end routing scenarios against the public API

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use cadre::config::LedgerConfig;
use cadre::{
    AgentDescriptor, AgentId, AuditLedger, Disposition, FileSink, HierarchyIndex, LedgerBlock, LedgerError, LedgerSink,
    MemorySink, Message, MessageId, MessageType, Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorHandle,
    Outcome, Priority,
};

fn config(mailbox_capacity: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        mailbox_capacity,
        ledger: LedgerConfig {
            checkpoint_interval: None,
            ..LedgerConfig::default()
        },
        ..OrchestratorConfig::default()
    }
}

/// CEO (1) <- B (2) <- {A, C} (3)
fn org() -> Result<HierarchyIndex> {
    Ok(HierarchyIndex::new(vec![
        AgentDescriptor::root("CEO"),
        AgentDescriptor::reporting("B", 2, "CEO"),
        AgentDescriptor::reporting("A", 3, "B"),
        AgentDescriptor::reporting("C", 3, "B"),
    ])?)
}

/// Sink whose appends fail once the switch is flipped
#[derive(Default)]
struct FailingSink {
    inner: MemorySink,
    failing: AtomicBool,
}

#[async_trait]
impl LedgerSink for FailingSink {
    async fn append(&self, blocks: &[LedgerBlock]) -> Result<(), LedgerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::Sink("injected failure".into()));
        }
        self.inner.append(blocks).await
    }

    async fn read_all(&self) -> Result<Vec<LedgerBlock>, LedgerError> {
        self.inner.read_all().await
    }
}

#[tokio::test]
async fn direct_delivery() -> Result<()> {
    let orch = Orchestrator::in_memory(org()?, config(16)).await?;

    let receipt = orch.submit(Message::query("A", "C", json!({"q": "status"}))).await?;

    assert_eq!(receipt.hops.len(), 1);
    assert_eq!(receipt.hops[0].ledger_index, 0);
    assert_eq!(orch.mailbox(&AgentId::from("C")).map(|m| m.len()), Some(1));
    assert_eq!(orch.ledger().len().await?, 1);
    Ok(())
}

#[tokio::test]
async fn escalation_chain_reaches_the_root() -> Result<()> {
    let orch = Orchestrator::in_memory(org()?, config(16)).await?;

    let receipt = orch.submit(Message::query("A", "C", json!({}))).await?;
    let mut hop = receipt.hop_id().expect("one hop");

    // C -> B, B -> CEO, then CEO gives up
    for _ in 0..3 {
        let next = orch.report_outcome(hop, Outcome::LowConfidence).await?;
        hop = next.hop_id().expect("one hop");
    }

    let blocks = orch.ledger().export().await?;
    assert_eq!(blocks.len(), 4);

    let records: Vec<_> = blocks.iter().filter_map(LedgerBlock::routing).collect();
    assert!(records.iter().all(|r| r.message_id == receipt.message_id));
    let seqs: Vec<u32> = records.iter().map(|r| r.hop_id.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);

    let recipients: Vec<&str> = records.iter().map(|r| r.recipient.as_str()).collect();
    assert_eq!(recipients, vec!["C", "B", "CEO", "CEO"]);
    assert_eq!(records[3].disposition, Disposition::DeadLettered);
    assert_eq!(records[2].priority, Priority::Critical);
    Ok(())
}

#[tokio::test]
async fn mailbox_overflow_evicts_oldest_normal() -> Result<()> {
    let orch = Orchestrator::in_memory(org()?, config(2)).await?;

    let first = orch.submit(Message::query("A", "C", json!({"n": 1}))).await?;
    orch.submit(Message::query("A", "C", json!({"n": 2}))).await?;

    let err = orch
        .submit(Message::query("A", "C", json!({"n": 3})))
        .await
        .expect_err("third NORMAL message must be rejected");
    assert!(matches!(err, OrchestratorError::MailboxFull(_)));

    let critical = orch
        .submit(Message::query("A", "C", json!({"n": 4})).with_priority(Priority::Critical))
        .await?;
    assert_eq!(critical.hops[0].displaced, first.hop_id());

    // the displaced hop gets a terminal block in the same batch
    let trail = orch.ledger().audit_trail(first.message_id).await?;
    let dispositions: Vec<Disposition> = trail.iter().filter_map(LedgerBlock::routing).map(|r| r.disposition).collect();
    assert_eq!(dispositions, vec![Disposition::Delivered, Disposition::DeadLettered]);
    assert_eq!(orch.ledger().len().await?, 4);

    let mailbox = orch.mailbox(&AgentId::from("C")).expect("mailbox");
    assert_eq!(mailbox.len(), 2);
    let order: Vec<serde_json::Value> = mailbox.drain().into_iter().map(|m| m.payload["n"].clone()).collect();
    assert_eq!(order, vec![json!(4), json!(2)]);
    Ok(())
}

#[tokio::test]
async fn failed_ledger_append_enqueues_nothing() -> Result<()> {
    let sink = Arc::new(FailingSink::default());
    let cfg = config(16);
    let ledger = AuditLedger::open(sink.clone(), &cfg.ledger).await?;
    let orch = Orchestrator::new(org()?, ledger, cfg);

    sink.failing.store(true, Ordering::SeqCst);
    let err = orch
        .submit(Message::query("A", "C", json!({})))
        .await
        .expect_err("append must fail");

    assert!(matches!(err, OrchestratorError::LedgerUnavailable(_)));
    assert_eq!(orch.mailbox(&AgentId::from("C")).map(|m| m.len()), Some(0));
    assert_eq!(orch.in_flight_count(), 0);
    assert!(sink.inner.is_empty());

    // broadcast copies are all-or-nothing too
    let err = orch
        .submit(Message::new("B", MessageType::Broadcast, json!({})))
        .await
        .expect_err("append must fail");
    assert!(matches!(err, OrchestratorError::LedgerUnavailable(_)));
    assert_eq!(orch.mailbox(&AgentId::from("A")).map(|m| m.len()), Some(0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_get_gap_free_ledger() -> Result<()> {
    const PRODUCERS: usize = 8;
    const MESSAGES: usize = 25;

    let mut agents = vec![AgentDescriptor::root("CEO")];
    for p in 0..PRODUCERS {
        agents.push(AgentDescriptor::reporting(format!("P{p}"), 2, "CEO"));
        agents.push(AgentDescriptor::reporting(format!("R{p}"), 3, format!("P{p}")));
    }
    let orch = OrchestratorHandle::new(Orchestrator::in_memory(HierarchyIndex::new(agents)?, config(MESSAGES)).await?);

    let mut tasks = Vec::new();
    for p in 0..PRODUCERS {
        let orch = orch.clone();
        tasks.push(tokio::spawn(async move {
            for m in 0..MESSAGES {
                orch.submit(Message::query(format!("P{p}"), format!("R{p}"), json!({"m": m})))
                    .await?;
            }
            Ok::<_, OrchestratorError>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    let blocks = orch.ledger().export().await?;
    assert_eq!(blocks.len(), PRODUCERS * MESSAGES);
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.index, i as u64);
    }
    for p in 0..PRODUCERS {
        let mailbox = orch.mailbox(&AgentId::from(format!("R{p}"))).expect("mailbox");
        assert_eq!(mailbox.len(), MESSAGES);
    }
    assert!(orch.validate_ledger().await?.is_intact());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mailbox_order_matches_ledger_order() -> Result<()> {
    const TASKS: usize = 16;
    const MESSAGES: usize = 20;

    let orch = OrchestratorHandle::new(Orchestrator::in_memory(org()?, config(TASKS * MESSAGES)).await?);

    let mut tasks = Vec::new();
    for t in 0..TASKS {
        let orch = orch.clone();
        tasks.push(tokio::spawn(async move {
            for m in 0..MESSAGES {
                orch.submit(Message::query("A", "C", json!({"t": t, "m": m}))).await?;
            }
            Ok::<_, OrchestratorError>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    let ledger_order: Vec<_> = orch
        .ledger()
        .export()
        .await?
        .iter()
        .filter_map(LedgerBlock::routing)
        .filter(|r| r.recipient.as_str() == "C")
        .map(|r| r.hop_id)
        .collect();
    let queue_order: Vec<_> = orch
        .mailbox(&AgentId::from("C"))
        .expect("mailbox")
        .drain()
        .iter()
        .map(Message::hop_id)
        .collect();

    assert_eq!(queue_order.len(), TASKS * MESSAGES);
    assert_eq!(queue_order, ledger_order);
    Ok(())
}

#[tokio::test]
async fn duplicate_submission_never_enters() -> Result<()> {
    let orch = Orchestrator::in_memory(org()?, config(16)).await?;
    let id = MessageId::new();

    orch.submit(Message::query("A", "C", json!({})).with_id(id)).await?;
    let err = orch
        .submit(Message::query("A", "C", json!({})).with_id(id))
        .await
        .expect_err("same id while in flight");

    assert!(matches!(err, OrchestratorError::DuplicateMessage(_)));
    assert_eq!(orch.ledger().audit_trail(id).await?.len(), 1);
    assert_eq!(orch.mailbox(&AgentId::from("C")).map(|m| m.len()), Some(1));
    Ok(())
}

#[tokio::test]
async fn file_ledger_detects_edits_on_disk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("audit.jsonl");
    let cfg = config(16);

    {
        let ledger = AuditLedger::open(Arc::new(FileSink::new(&path)), &cfg.ledger).await?;
        let orch = Orchestrator::new(org()?, ledger, cfg.clone());
        for _ in 0..3 {
            orch.submit(Message::query("A", "C", json!({}))).await?;
        }
        assert_eq!(orch.verify_ledger().await?, 3);
    }

    // reopening resumes the chain
    let ledger = AuditLedger::open(Arc::new(FileSink::new(&path)), &cfg.ledger).await?;
    let orch = Orchestrator::new(org()?, ledger, cfg);
    let receipt = orch.submit(Message::query("C", "A", json!({}))).await?;
    assert_eq!(receipt.hops[0].ledger_index, 3);

    let contents = std::fs::read_to_string(&path)?;
    let mut lines: Vec<String> = contents.lines().map(str::to_owned).collect();
    lines[1] = lines[1].replace(r#""recipient":"C""#, r#""recipient":"B""#);
    std::fs::write(&path, lines.join("\n") + "\n")?;

    let status = orch.validate_ledger().await?;
    assert_eq!(status.first_invalid_index(), Some(1));
    assert!(matches!(
        orch.verify_ledger().await,
        Err(OrchestratorError::ChainTamperDetected { index: 1 })
    ));
    Ok(())
}
