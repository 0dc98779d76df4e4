//! Order submission over the bridge's command/response file pair.
//!
//! An order moves `Created → Transmitted → Pending → Resolved`. The
//! command document is written through the bridge, which lands it as
//! `trade_commands.json` for the charting host; the response appears as
//! `trade_response_{order_id}.json` and is polled until the deadline.
//! Exactly one terminal outcome reaches the submitter; responses observed
//! after resolution are logged and dropped.

use std::{collections::HashMap,
          sync::{atomic::{AtomicU64, Ordering},
                 Arc},
          time::Duration};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{config::OrdersConfig,
            error::{Error, Result},
            symbols::{ContractId, SymbolRegistry},
            transport::BridgeClient,
            TimestampUs};

/// Tombstones for resolved orders are kept this long so a late response
/// can still be recognised, logged and dropped.
const TOMBSTONE_RETENTION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Submitted,
    Rejected,
    Failed,
    Filled,
    #[serde(rename = "PARTIAL")]
    PartiallyFilled,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Day,
}

/// A requested trade, owned by the bridge until a terminal response is
/// observed or the deadline elapses.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderCommand {
    pub order_id:      String,
    pub symbol:        ContractId,
    pub side:          OrderSide,
    pub quantity:      u32,
    pub order_type:    OrderType,
    pub limit_price:   Option<Decimal>,
    pub stop_price:    Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub timestamp_us:  TimestampUs,
}

/// The command document as the charting host consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderCommandFile {
    order_id: String,
    symbol:   String,
    side:     OrderSide,
    quantity: u32,
    price:    f64,
    #[serde(rename = "type")]
    order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id:        String,
    pub status:          OrderStatus,
    #[serde(default)]
    pub message:         String,
    pub timestamp_us:    TimestampUs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_order_id: Option<String>,
}

impl OrderResponse {
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Rejected
                | OrderStatus::Failed
                | OrderStatus::Filled
                | OrderStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Created,
    Transmitted,
    Pending,
    Resolved,
}

#[derive(Debug)]
struct TrackedOrder {
    state:       OrderState,
    resolved_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct OrderCounters {
    pub submitted:      AtomicU64,
    pub resolved:       AtomicU64,
    pub timeouts:       AtomicU64,
    pub late_responses: AtomicU64,
}

/// Correlates command files with response files by `order_id`. Owns the
/// pending-order table; per-id uniqueness is the only global
/// serialization.
pub struct OrderBridge {
    transport: Arc<BridgeClient>,
    registry:  Arc<SymbolRegistry>,
    config:    OrdersConfig,
    orders:    Mutex<HashMap<String, TrackedOrder>>,
    counters:  Arc<OrderCounters>,
}

impl std::fmt::Debug for OrderBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("OrderBridge").finish_non_exhaustive()
    }
}

impl OrderBridge {
    pub fn new(
        transport: Arc<BridgeClient>,
        registry: Arc<SymbolRegistry>,
        config: OrdersConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            config,
            orders: Mutex::new(HashMap::new()),
            counters: Arc::new(OrderCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<OrderCounters> { Arc::clone(&self.counters) }

    /// Submit an order and wait for its terminal outcome. A response whose
    /// own `timestamp_us` is at or before the deadline wins even when it is
    /// read late; one stamped after the deadline loses to the timeout. With
    /// no response by the deadline the outcome is `Failed` with a timeout
    /// message.
    #[instrument(level = "debug", skip(self, command), fields(order_id = %command.order_id))]
    pub async fn submit(&self, command: OrderCommand) -> Result<OrderResponse> {
        self.validate(&command)?;
        {
            let mut orders = self.orders.lock();
            match orders.get(&command.order_id) {
                Some(tracked) if tracked.state != OrderState::Resolved => {
                    return Err(Error::DuplicateOrderId(command.order_id));
                },
                _ => {},
            }
            orders.insert(command.order_id.clone(), TrackedOrder {
                state:       OrderState::Created,
                resolved_at: None,
            });
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let deadline = Instant::now() + self.config.submit_timeout();
        let deadline_us = chrono::Utc::now().timestamp_micros()
            + self.config.submit_timeout().as_micros() as TimestampUs;
        let outcome = self.transmit_and_poll(&command, deadline, deadline_us).await;

        let mut orders = self.orders.lock();
        match outcome {
            Ok(response) => {
                orders.insert(command.order_id.clone(), TrackedOrder {
                    state:       OrderState::Resolved,
                    resolved_at: Some(Instant::now()),
                });
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                Ok(response)
            },
            Err(e) => {
                // transmission never happened; ownership returns to the caller
                orders.remove(&command.order_id);
                Err(e)
            },
        }
    }

    async fn transmit_and_poll(
        &self,
        command: &OrderCommand,
        deadline: Instant,
        deadline_us: TimestampUs,
    ) -> Result<OrderResponse> {
        let wire = to_wire(command);
        let body = serde_json::to_value(&wire)
            .map_err(|e| Error::decode(command.order_id.clone(), e.to_string()))?;
        let ack = self.transport.submit_order(&body).await?;
        debug!(status = %ack.status, "command file transmitted");
        self.set_state(&command.order_id, OrderState::Transmitted);
        self.set_state(&command.order_id, OrderState::Pending);

        loop {
            // read first: a response stamped at or before the deadline wins
            // regardless of where the polling clock stands when it is read
            if let Some(bytes) = self.transport.order_status(&command.order_id).await? {
                let response: OrderResponse = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::decode(command.order_id.clone(), e.to_string()))?;
                if response.timestamp_us <= deadline_us {
                    info!(order_id = %command.order_id, status = ?response.status, "order resolved");
                    return Ok(response);
                }
                self.counters.late_responses.fetch_add(1, Ordering::Relaxed);
                warn!(
                    order_id = %command.order_id,
                    response_ts = response.timestamp_us,
                    deadline_us,
                    "response stamped past the deadline, dropped"
                );
                return Ok(self.timeout_response(command));
            }
            if Instant::now() >= deadline {
                return Ok(self.timeout_response(command));
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    fn timeout_response(&self, command: &OrderCommand) -> OrderResponse {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(order_id = %command.order_id, "order deadline elapsed");
        OrderResponse {
            order_id:        command.order_id.clone(),
            status:          OrderStatus::Failed,
            message:         "timeout".to_string(),
            timestamp_us:    chrono::Utc::now().timestamp_micros(),
            broker_order_id: None,
        }
    }

    /// Check resolved orders once for responses that arrived after their
    /// outcome was already delivered; log and drop them, then evict old
    /// tombstones. Driven periodically by the scheduler.
    pub async fn sweep_late_responses(&self) {
        let candidates: Vec<String> = {
            let orders = self.orders.lock();
            orders
                .iter()
                .filter(|(_, t)| t.state == OrderState::Resolved)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for order_id in candidates {
            if let Ok(Some(bytes)) = self.transport.order_status(&order_id).await {
                self.counters.late_responses.fetch_add(1, Ordering::Relaxed);
                warn!(
                    order_id,
                    bytes = bytes.len(),
                    "response observed after resolution, dropped"
                );
            }
        }
        self.orders.lock().retain(|_, tracked| {
            tracked
                .resolved_at
                .map_or(true, |at| at.elapsed() < TOMBSTONE_RETENTION)
        });
    }

    pub fn state_of(&self, order_id: &str) -> Option<OrderState> {
        self.orders.lock().get(order_id).map(|t| t.state)
    }

    fn set_state(&self, order_id: &str, state: OrderState) {
        if let Some(tracked) = self.orders.lock().get_mut(order_id) {
            tracked.state = state;
        }
    }

    /// Refuse to transmit anything structurally unsound or aimed at a
    /// contract the registry no longer considers active.
    fn validate(&self, command: &OrderCommand) -> Result<()> {
        let refuse = |reason: &str| {
            Err(Error::InvalidOrder {
                order_id: command.order_id.clone(),
                reason:   reason.to_string(),
            })
        };
        if command.order_id.is_empty() {
            return refuse("empty order id");
        }
        if command.quantity == 0 {
            return refuse("non-positive quantity");
        }
        match command.order_type {
            OrderType::Limit if command.limit_price.is_none() => {
                return refuse("limit order without limit price");
            },
            OrderType::Stop if command.stop_price.is_none() => {
                return refuse("stop order without stop price");
            },
            _ => {},
        }
        let active = self
            .registry
            .all_active()
            .iter()
            .any(|c| c.id() == command.symbol);
        if !active {
            return refuse("symbol is not an active contract");
        }
        Ok(())
    }
}

fn to_wire(command: &OrderCommand) -> OrderCommandFile {
    let price = command
        .limit_price
        .and_then(|p| p.to_string().parse::<f64>().ok())
        .unwrap_or(0.0);
    OrderCommandFile {
        order_id: command.order_id.clone(),
        symbol: command.symbol.to_string(),
        side: command.side,
        quantity: command.quantity,
        price,
        order_type: command.order_type,
        stop_price: command
            .stop_price
            .and_then(|p| p.to_string().parse::<f64>().ok()),
    }
}
