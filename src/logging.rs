//! 日志初始化
//!
//! 控制台输出, 级别由 RUST_LOG 控制, 缺省 info

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化全局 tracing subscriber, 重复调用无副作用
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    // ort 自身日志很多, 只保留 warn
    let filter_string = format!("{},ort=warn", default_level);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_string));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init();
}
