//! Implementations of the ports.
//!
//! - `memory`: `InMemoryJobStore`（テスト・開発用。プロセス終了で消える）
//! - `postgres`: `PgJobStore`（本番用。feature `postgres`）

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use self::memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use self::postgres::PgJobStore;
