//! Live ingest flow: snapshot frames in, persisted ticks and subscriber
//! deliveries out.

use pretty_assertions::assert_eq;
use sierra_bridge_api::{feed::StreamItem,
                        prelude::{Interval, SnapshotFrame},
                        symbols::ContractId,
                        Result};

use crate::all::service_fixture;

fn frame(sequence: u16, timestamp_us: i64) -> SnapshotFrame {
    let raw = format!(
        r#"{{
            "symbol": "NQU25-CME",
            "timestamp_us": {timestamp_us},
            "price": 23432.50, "volume": 2,
            "bid": 23432.00, "ask": 23433.00,
            "bid_size": 10, "ask_size": 15,
            "last_size": 2, "side": "B",
            "sequence": {sequence}, "vwap": 23432.35,
            "total_volume": 10452, "trade_count": 1234,
            "precision": "microsecond",
            "source": "sierra_chart_acsil_v3"
        }}"#
    );
    SnapshotFrame::from_json("NQU25-CME", raw.as_bytes()).unwrap()
}

#[tokio::test]
async fn accepted_snapshots_reach_store_and_subscribers() -> Result<()> {
    let (_dir, service) = service_fixture();
    let symbol: ContractId = "NQU25-CME".parse()?;
    let ingestor = service.ingestor();
    let mut subscription = service.subscribe("NQ")?;

    // duplicate and out-of-order frames interleaved with good ones
    for (sequence, ts) in [(10u16, 1_000i64), (10, 1_000), (11, 2_000), (13, 3_000), (12, 3_500)]
    {
        let _ = ingestor.accept(symbol.clone(), frame(sequence, ts), None)?;
    }

    // the subscriber observes exactly the accepted ticks, in order
    let mut sequences = Vec::new();
    for _ in 0..3 {
        match subscription.next().await {
            Some(StreamItem::Tick(tick)) => sequences.push(tick.sequence),
            other => panic!("unexpected stream item {other:?}"),
        }
    }
    assert_eq!(sequences, vec![10, 11, 13]);

    // durability: a range query immediately returns what was accepted
    let stored = service
        .store()
        .range_ticks(&symbol, Interval::new(0, 10_000))?;
    assert_eq!(
        stored.iter().map(|t| (t.timestamp_us, t.sequence)).collect::<Vec<_>>(),
        vec![(1_000, 10), (2_000, 11), (3_000, 13)]
    );

    let counters = ingestor.counters().snapshot();
    assert_eq!(counters.accepted, 3);
    assert_eq!(counters.duplicates, 1);
    assert_eq!(counters.out_of_order, 1);
    Ok(())
}

#[tokio::test]
async fn latest_follows_the_stream() -> Result<()> {
    let (_dir, service) = service_fixture();
    let symbol: ContractId = "NQU25-CME".parse()?;
    let ingestor = service.ingestor();

    assert!(service.latest("NQ")?.is_none());
    ingestor.accept(symbol.clone(), frame(1, 1_000), None)?;
    ingestor.accept(symbol.clone(), frame(2, 2_000), None)?;
    let latest = service.latest("NQ")?.expect("tick persisted");
    assert_eq!(latest.timestamp_us, 2_000);
    assert_eq!(latest.sequence, 2);
    Ok(())
}

#[tokio::test]
async fn producer_restart_is_accepted_as_new_session() -> Result<()> {
    let (_dir, service) = service_fixture();
    let symbol: ContractId = "NQU25-CME".parse()?;
    let ingestor = service.ingestor();

    ingestor.accept(symbol.clone(), frame(60_000, 1_000), None)?;
    // the producer restarted and its sequence fell back by far more than
    // half the space; the forward-window arithmetic accepts it
    let accepted = ingestor.accept(symbol.clone(), frame(5, 2_000), None)?;
    assert!(accepted.is_some());
    Ok(())
}
