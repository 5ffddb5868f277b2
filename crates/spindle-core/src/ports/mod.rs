//! Ports - 抽象化レイヤー
//!
//! worker / periodic deferrer / app はこの trait 群だけに依存する。
//! 実装（in-memory, PostgreSQL）は `impls` 側。
//!
//! - `JobStore`: job の永続化と原子的な claim（唯一の調停点）
//! - `Clock`: 時刻の注入（テストでは FixedClock）
//! - `WakeSignal` / `Channel`: idle worker を起こす通知
//! - `EventSink`: status 遷移ごとの観測フック

pub mod clock;
pub mod event_sink;
pub mod job_store;
pub mod notify;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink, StatusTransition, TracingEventSink};
pub use self::job_store::{GroupBy, GroupStats, JobFilter, JobStore};
pub use self::notify::{Channel, WakeListener, WakeSignal};
