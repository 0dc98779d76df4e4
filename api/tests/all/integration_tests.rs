use pretty_assertions::assert_eq;
use sierra_bridge_api::{bars::Timeframe,
                        config::Config,
                        error::Error,
                        orders::{OrderCommand, OrderSide, OrderType, TimeInForce},
                        symbols::{RegistryEvent, SymbolRegistry},
                        Result,
                        TimeStamp};

use crate::all::{service_fixture, SAMPLE_CONFIG};

#[test]
fn rollover_at_the_boundary_publishes_one_event() -> Result<()> {
    // pre_roll_days = 0 puts the transition exactly at expiration midnight
    let raw = SAMPLE_CONFIG
        .replace("__DATA_DIR__", "/tmp/unused")
        .replace("pre_roll_days = 10", "pre_roll_days = 0")
        .replace(
            "[\"2025-09-19\", \"2025-12-19\", \"2026-03-20\", \"2026-06-19\"]",
            "[\"2025-09-09\", \"2025-12-09\"]",
        );
    let config = Config::from_toml(&raw)?;
    let before: TimeStamp = "2025-09-08T23:59:59Z".parse().unwrap();
    let after: TimeStamp = "2025-09-09T00:00:01Z".parse().unwrap();

    let registry = SymbolRegistry::from_config(&config.symbols, before)?;
    let events = registry.subscribe();
    assert_eq!(registry.current("NQ")?.id().as_str(), "NQU25-CME");

    registry.refresh(after)?;
    assert_eq!(registry.current("NQ")?.id().as_str(), "NQZ25-CME");

    let transitions = events
        .try_iter()
        .filter(|e| matches!(e, RegistryEvent::ActiveSetChanged { .. }))
        .count();
    assert_eq!(transitions, 1);
    Ok(())
}

#[tokio::test]
async fn order_invariants_are_checked_before_transmission() {
    let (_dir, service) = service_fixture();
    let order = |order_id: &str| OrderCommand {
        order_id:      order_id.to_string(),
        symbol:        "NQU25-CME".parse().unwrap(),
        side:          OrderSide::Buy,
        quantity:      1,
        order_type:    OrderType::Market,
        limit_price:   None,
        stop_price:    None,
        time_in_force: TimeInForce::Day,
        timestamp_us:  1_722_000_000_000_000,
    };

    let mut zero_qty = order("Q0");
    zero_qty.quantity = 0;
    assert!(matches!(
        service.submit_order(zero_qty).await,
        Err(Error::InvalidOrder { .. })
    ));

    let mut no_limit = order("L0");
    no_limit.order_type = OrderType::Limit;
    assert!(matches!(
        service.submit_order(no_limit).await,
        Err(Error::InvalidOrder { .. })
    ));

    let mut expired = order("E0");
    expired.symbol = "NQZ25-CME".parse().unwrap();
    assert!(matches!(
        service.submit_order(expired).await,
        Err(Error::InvalidOrder { .. })
    ));
}

#[tokio::test]
async fn gap_report_covers_the_lookback_window() -> Result<()> {
    let (_dir, service) = service_fixture();
    let now: TimeStamp = "2025-08-01T00:00:00Z".parse().unwrap();
    // nothing stored yet: every expected session in the window is a gap
    let gaps = service.report_gaps("NQ", 14, now)?;
    assert!(!gaps.is_empty());
    assert!(gaps.iter().any(|g| g.timeframe == Timeframe::Daily));
    assert!(gaps.iter().any(|g| g.timeframe == Timeframe::Tick));
    for gap in &gaps {
        assert!(gap.interval.start < gap.interval.end);
        assert!(gap.interval.end <= now.timestamp_micros());
    }
    // newest-first within the recent window
    let ticks: Vec<_> = gaps
        .iter()
        .filter(|g| g.timeframe == Timeframe::Tick)
        .collect();
    for pair in ticks.windows(2) {
        assert!(pair[0].interval.end >= pair[1].interval.end);
    }
    Ok(())
}

#[test]
fn unknown_root_surfaces_from_every_query() {
    let (_dir, service) = service_fixture();
    assert!(matches!(service.latest("ZB"), Err(Error::UnknownRoot(_))));
    assert!(matches!(
        service.subscribe("ZB"),
        Err(Error::UnknownRoot(_))
    ));
}
