// Safekeep - 日志初始化模块

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 选择默认日志级别：`--verbose` 或配置中的 debug 开关为 `debug`，否则为 `info`
pub fn level_for(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// 初始化日志，`RUST_LOG` 优先于 `level`，无效的过滤器回退到 `info`
///
/// 日志写到 stderr，stdout 留给命令输出。重复初始化会返回错误。
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()?;

    Ok(())
}
