use std::{collections::{BTreeMap, BTreeSet, HashSet},
          fmt::{Display, Formatter},
          str::FromStr,
          sync::Arc};

use arc_swap::ArcSwap;
use chrono::{Datelike, NaiveDate, TimeZone, Utc, Weekday};
use crossbeam_channel::{unbounded, Receiver, Sender};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use rust_decimal::Decimal;

use crate::{config::{RootConfig, SymbolsConfig},
            error::{Error, Result},
            TimeStamp};

lazy_static! {
    static ref CONTRACT_ID_RE: Regex =
        Regex::new(r"^([A-Z0-9]{1,3})([FGHJKMNQUVXZ])([0-9]{2})-([A-Z]+)$").unwrap();
}

/// Rollover-pending notifications fire once per contract transition at each
/// of these day counts.
pub const ALERT_THRESHOLDS: [u32; 5] = [30, 15, 7, 3, 1];

/// Canonical contract identifier, `{root}{month}{yy}-{exchange}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContractId(String);

impl ContractId {
    pub fn as_str(&self) -> &str { &self.0 }

    pub fn root(&self) -> &str {
        CONTRACT_ID_RE
            .captures(&self.0)
            .map_or("", |c| c.get(1).map_or("", |m| m.as_str()))
    }
}

impl Display for ContractId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result { write!(f, "{}", self.0) }
}

impl FromStr for ContractId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if CONTRACT_ID_RE.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::decode(s, "not a canonical contract identifier"))
        }
    }
}

impl serde::Serialize for ContractId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ContractId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonthCode {
    F,
    G,
    H,
    J,
    K,
    M,
    N,
    Q,
    U,
    V,
    X,
    Z,
}

impl MonthCode {
    /// Code for a calendar month, 1-based.
    pub const fn from_month(month: u32) -> Option<Self> {
        match month {
            1 => Some(Self::F),
            2 => Some(Self::G),
            3 => Some(Self::H),
            4 => Some(Self::J),
            5 => Some(Self::K),
            6 => Some(Self::M),
            7 => Some(Self::N),
            8 => Some(Self::Q),
            9 => Some(Self::U),
            10 => Some(Self::V),
            11 => Some(Self::X),
            12 => Some(Self::Z),
            _ => None,
        }
    }

    pub const fn as_char(self) -> char {
        match self {
            Self::F => 'F',
            Self::G => 'G',
            Self::H => 'H',
            Self::J => 'J',
            Self::K => 'K',
            Self::M => 'M',
            Self::N => 'N',
            Self::Q => 'Q',
            Self::U => 'U',
            Self::V => 'V',
            Self::X => 'X',
            Self::Z => 'Z',
        }
    }

    pub const fn is_quarterly(self) -> bool {
        matches!(self, Self::H | Self::M | Self::U | Self::Z)
    }
}

impl FromStr for MonthCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let res = match s {
            "F" => Self::F,
            "G" => Self::G,
            "H" => Self::H,
            "J" => Self::J,
            "K" => Self::K,
            "M" => Self::M,
            "N" => Self::N,
            "Q" => Self::Q,
            "U" => Self::U,
            "V" => Self::V,
            "X" => Self::X,
            "Z" => Self::Z,
            _ => return Err(Error::decode(s, "unknown month code")),
        };
        Ok(res)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString)]
pub enum AssetClass {
    Future,
    Forex,
    Index,
    Commodity,
}

impl Default for AssetClass {
    fn default() -> Self { Self::Future }
}

/// A specific expiring instrument. Never mutated after construction;
/// superseded by the next contract at its rollover date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub root:          String,
    pub exchange:      String,
    pub month:         MonthCode,
    /// Two-digit expiration year as rendered in the identifier.
    pub year:          u8,
    pub expiration:    NaiveDate,
    /// First day the successor contract is active.
    pub rollover_date: NaiveDate,
    pub tick_size:     Decimal,
    pub multiplier:    Decimal,
    pub asset_class:   AssetClass,
    pub priority:      u32,
}

impl Contract {
    pub fn id(&self) -> ContractId {
        ContractId(format!(
            "{}{}{:02}-{}",
            self.root,
            self.month.as_char(),
            self.year,
            self.exchange
        ))
    }

    /// Instant at which this contract stops being current (UTC midnight of
    /// the rollover date).
    pub fn rollover_instant(&self) -> TimeStamp {
        Utc.from_utc_datetime(&self.rollover_date.and_hms_opt(0, 0, 0).unwrap())
    }
}

impl Display for Contract {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result { write!(f, "{}", self.id()) }
}

/// Ordered rollover schedule for one root. Contracts are listed
/// chronologically; each is current strictly before its rollover date.
#[derive(Debug, Clone)]
pub struct RolloverSchedule {
    pub root:      String,
    pub contracts: Vec<Contract>,
}

impl RolloverSchedule {
    /// The active contract at `now`: the earliest-expiring contract whose
    /// rollover instant is still ahead.
    pub fn current_at(&self, now: TimeStamp) -> Result<&Contract> {
        if now < self.coverage_start() {
            return Err(Error::configuration(format!(
                "{}: clock {} precedes the configured schedule",
                self.root, now
            )));
        }
        self.contracts
            .iter()
            .find(|c| now < c.rollover_instant())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "{}: no contract with a rollover date after {}",
                    self.root, now
                ))
            })
    }

    /// Earliest instant the schedule can answer for. The first contract's
    /// window is assumed one rollover period long.
    fn coverage_start(&self) -> TimeStamp {
        let first = self.contracts[0].rollover_instant();
        let period = match self.contracts.get(1) {
            Some(second) => second.rollover_instant() - first,
            None => chrono::Duration::days(91),
        };
        first - period
    }
}

/// Walk `n` business days back from `date`, skipping weekends and the
/// configured holidays.
pub fn subtract_business_days(date: NaiveDate, n: u32, holidays: &[NaiveDate]) -> NaiveDate {
    let mut current = date;
    let mut remaining = n;
    while remaining > 0 {
        current = current.pred_opt().expect("date underflow");
        let weekend = matches!(current.weekday(), Weekday::Sat | Weekday::Sun);
        if !weekend && !holidays.contains(&current) {
            remaining -= 1;
        }
    }
    current
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// The set returned by `all_active()` changed. Totally ordered within
    /// the registry; one event per transition.
    ActiveSetChanged {
        added:   Vec<ContractId>,
        removed: Vec<ContractId>,
    },
    /// A rollover threshold was crossed. Fires at most once per
    /// (contract, threshold).
    RolloverPending {
        root:      String,
        contract:  ContractId,
        days_left: i64,
        threshold: u32,
    },
}

#[derive(Debug)]
struct RegistrySnapshot {
    schedules: BTreeMap<String, RolloverSchedule>,
    active:    BTreeMap<String, Contract>,
}

struct RegistryState {
    last_published: BTreeSet<ContractId>,
    fired:          HashSet<(ContractId, u32)>,
    subscribers:    Vec<Sender<RegistryEvent>>,
}

/// Deterministic resolution of logical roots to currently-active contracts.
///
/// Reads are lock-free against an immutable snapshot; mutation happens only
/// through [`SymbolRegistry::refresh`], which also serializes event
/// publication so change events are totally ordered.
pub struct SymbolRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    state:    Mutex<RegistryState>,
}

impl std::fmt::Debug for SymbolRegistry {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("SymbolRegistry")
            .field("roots", &self.snapshot.load().schedules.keys())
            .finish()
    }
}

impl SymbolRegistry {
    pub fn from_config(config: &SymbolsConfig, now: TimeStamp) -> Result<Self> {
        let mut schedules = BTreeMap::new();
        for root in &config.roots {
            let schedule = build_schedule(root)?;
            schedules.insert(root.root.clone(), schedule);
        }
        let active = resolve_active(&schedules, now)?;
        let registry = Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot { schedules, active }),
            state:    Mutex::new(RegistryState {
                last_published: BTreeSet::new(),
                fired:          HashSet::new(),
                subscribers:    Vec::new(),
            }),
        };
        registry.state.lock().last_published = registry.active_set();
        Ok(registry)
    }

    /// The contract currently backing `root`.
    pub fn current(&self, root: &str) -> Result<Contract> {
        let snapshot = self.snapshot.load();
        snapshot
            .active
            .get(root)
            .cloned()
            .ok_or_else(|| Error::UnknownRoot(root.to_string()))
    }

    pub fn schedule(&self, root: &str) -> Result<RolloverSchedule> {
        let snapshot = self.snapshot.load();
        snapshot
            .schedules
            .get(root)
            .cloned()
            .ok_or_else(|| Error::UnknownRoot(root.to_string()))
    }

    /// Every currently-active contract, ordered by root.
    pub fn all_active(&self) -> Vec<Contract> {
        self.snapshot.load().active.values().cloned().collect()
    }

    pub fn roots(&self) -> Vec<String> {
        self.snapshot.load().schedules.keys().cloned().collect()
    }

    pub fn priority_of(&self, root: &str) -> u32 {
        self.snapshot
            .load()
            .active
            .get(root)
            .map_or(u32::MAX, |c| c.priority)
    }

    pub fn days_until_rollover(&self, root: &str, now: TimeStamp) -> Result<i64> {
        let current = self.current(root)?;
        Ok((current.rollover_instant() - now).num_days())
    }

    /// Observe registry change and rollover-pending events. Events are
    /// published in a single total order.
    pub fn subscribe(&self) -> Receiver<RegistryEvent> {
        let (tx, rx) = unbounded();
        self.state.lock().subscribers.push(tx);
        rx
    }

    /// Re-resolve the active set against `now` and publish events for any
    /// transition or newly-crossed alert threshold. The scheduler calls this
    /// hourly; configuration reload calls it too.
    pub fn refresh(&self, now: TimeStamp) -> Result<()> {
        let snapshot = self.snapshot.load();
        let active = resolve_active(&snapshot.schedules, now)?;
        let next = Arc::new(RegistrySnapshot {
            schedules: snapshot.schedules.clone(),
            active,
        });

        // Publication happens under the state lock so that observers see
        // transitions in one total order.
        let mut state = self.state.lock();
        self.snapshot.store(next);

        let current_set = self.active_set();
        if current_set != state.last_published {
            let added = current_set
                .difference(&state.last_published)
                .cloned()
                .collect();
            let removed = state
                .last_published
                .difference(&current_set)
                .cloned()
                .collect();
            state.last_published = current_set;
            publish(&mut state.subscribers, RegistryEvent::ActiveSetChanged {
                added,
                removed,
            });
        }

        let snapshot = self.snapshot.load();
        for (root, contract) in &snapshot.active {
            let days_left = (contract.rollover_instant() - now).num_days();
            for threshold in ALERT_THRESHOLDS {
                if days_left <= threshold as i64
                    && state.fired.insert((contract.id(), threshold))
                {
                    publish(&mut state.subscribers, RegistryEvent::RolloverPending {
                        root: root.clone(),
                        contract: contract.id(),
                        days_left,
                        threshold,
                    });
                }
            }
        }
        Ok(())
    }

    fn active_set(&self) -> BTreeSet<ContractId> {
        self.snapshot
            .load()
            .active
            .values()
            .map(Contract::id)
            .collect()
    }
}

fn publish(subscribers: &mut Vec<Sender<RegistryEvent>>, event: RegistryEvent) {
    subscribers.retain(|tx| tx.send(event.clone()).is_ok());
}

fn resolve_active(
    schedules: &BTreeMap<String, RolloverSchedule>,
    now: TimeStamp,
) -> Result<BTreeMap<String, Contract>> {
    schedules
        .iter()
        .map(|(root, schedule)| Ok((root.clone(), schedule.current_at(now)?.clone())))
        .collect()
}

fn build_schedule(root: &RootConfig) -> Result<RolloverSchedule> {
    let asset_class = AssetClass::from_str(&root.asset_class).map_err(|_| {
        Error::configuration(format!(
            "{}: unknown asset class {:?}",
            root.root, root.asset_class
        ))
    })?;
    let mut contracts = Vec::with_capacity(root.expirations.len());
    for expiration in &root.expirations {
        let month = MonthCode::from_month(expiration.month()).ok_or_else(|| {
            Error::configuration(format!("{}: bad expiration {}", root.root, expiration))
        })?;
        if !root.months.iter().any(|m| m == &month.as_char().to_string()) {
            return Err(Error::configuration(format!(
                "{}: expiration {} falls in month {} outside the configured cycle",
                root.root,
                expiration,
                month.as_char()
            )));
        }
        contracts.push(Contract {
            root: root.root.clone(),
            exchange: root.exchange.clone(),
            month,
            year: (expiration.year() % 100) as u8,
            expiration: *expiration,
            rollover_date: subtract_business_days(
                *expiration,
                root.pre_roll_days,
                &root.holidays,
            ),
            tick_size: root.tick_size,
            multiplier: root.multiplier,
            asset_class,
            priority: root.priority,
        });
    }
    // expirations are validated ascending; the derived rollover dates must
    // stay strictly monotonic too
    if contracts.windows(2).any(|w| w[0].rollover_date >= w[1].rollover_date) {
        return Err(Error::configuration(format!(
            "{}: rollover dates are not strictly ascending",
            root.root
        )));
    }
    Ok(RolloverSchedule {
        root: root.root.clone(),
        contracts,
    })
}
