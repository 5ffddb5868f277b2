//! App - アプリケーション層
//!
//! ports と typed を組み合わせて、job の投入から実行・停止までを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder / App**: ワイヤリング、defer と管理操作
//! - **Worker**: worker loop 群（fetch → handle → finish / retry）
//! - **PeriodicDeferrer**: cron スケジュールによる defer
//! - **ShutdownCoordinator**: シグナル → graceful / force 停止
//! - **WorkerConfig**: worker の設定

pub mod builder;
pub mod config;
pub mod periodic;
pub mod shutdown;
pub mod worker;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError, DeferError};
pub use self::config::{DeleteJobCondition, WorkerConfig};
pub use self::periodic::{PeriodicDeferrer, PeriodicRegistry, PeriodicTask, ScheduleError};
pub use self::shutdown::{ShutdownCoordinator, ShutdownPhase};
pub use self::worker::{Worker, WorkerError};
