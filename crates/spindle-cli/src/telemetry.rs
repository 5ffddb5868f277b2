//! Tracing/logging initialization.
//!
//! `RUST_LOG` が無ければ `info`。`json` で 1 行 1 JSON の出力に切り替える。

use tracing_subscriber::EnvFilter;

pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // 2 回目以降の呼び出しは何もしない
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
