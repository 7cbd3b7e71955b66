//! Pi Node CLI
//!
//! 摄像头边缘代理：运行采集与健康监控，查看和校验配置

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pi_node_agent::config::{merge_config, sanitize_config};
use pi_node_agent::health::format_system_stats;
use pi_node_agent::{
    AgentConfig, AgentMetrics, AgentOptions, ConfigPaths, ConfigStore, EdgeAgent, ShellLauncher,
    SystemProbe,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "pi-node")]
#[command(about = "Pi Node - 摄像头边缘代理")]
#[command(version)]
struct Cli {
    /// 配置目录 (默认: ~/.config/pi-node)
    #[arg(long, global = true, env = "PI_NODE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动代理，直到收到 Ctrl-C
    Run {
        /// 用 shell 命令代替 ffmpeg 作为采集进程（输出 MJPEG 到 stdout）
        #[arg(long)]
        capture_command: Option<String>,
    },
    /// 打印生效配置（凭据已脱敏）
    Config {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 校验配置文件（叠加在默认值之上）
    Validate {
        /// JSON 配置文件路径
        file: PathBuf,
    },
    /// 采样一次主机指标
    Probe {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pi_node_agent=info,pi_node=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let paths = ConfigPaths::new(cli.config_dir.unwrap_or_else(ConfigPaths::default_dir));

    match cli.command {
        Commands::Run { capture_command } => run(paths, capture_command).await,
        Commands::Config { json } => show_config(paths, json),
        Commands::Validate { file } => validate(&file),
        Commands::Probe { json } => probe(json).await,
    }
}

async fn run(paths: ConfigPaths, capture_command: Option<String>) -> Result<()> {
    let metrics = Arc::new(AgentMetrics::new());
    let store = ConfigStore::load(paths, metrics.clone()).context("failed to load configuration")?;

    let mut options = AgentOptions::default();
    if let Some(script) = capture_command {
        info!(script = %script, "Using shell capture command");
        options.launcher = Arc::new(ShellLauncher::new(script));
    }

    let mut agent = EdgeAgent::new(Arc::new(store), metrics, options);
    agent.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    agent.shutdown().await;
    Ok(())
}

fn show_config(paths: ConfigPaths, json: bool) -> Result<()> {
    let metrics = Arc::new(AgentMetrics::new());
    let store = ConfigStore::load(paths, metrics).context("failed to load configuration")?;
    let config = store.get_config();
    let sanitized = sanitize_config(&config);

    if json {
        println!("{}", serde_json::to_string_pretty(&sanitized)?);
        return Ok(());
    }

    println!("配置目录: {}", store.paths().dir.display());
    println!("设备 ID:   {}", config.cloud.device_id);
    if let Some(url) = sanitized.pointer("/capture/sourceUrl").and_then(Value::as_str) {
        println!("视频源:    {}", url);
    }
    println!(
        "快照:      每 {}s 一帧, 缓存 {} 张, TTL {}s",
        config.snapshot.interval_sec, config.snapshot.cache_max, config.snapshot.cache_ttl_sec
    );
    match config.sync_interval() {
        Some(interval) => println!("云端同步:  每 {}s", interval.as_secs()),
        None => println!("云端同步:  关闭"),
    }
    Ok(())
}

fn validate(file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let document: Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    let merged = merge_config(&[&AgentConfig::defaults_value(), &document]);
    match AgentConfig::from_value(merged) {
        Ok(_) => {
            println!("✅ {} 有效", file.display());
            Ok(())
        }
        Err(e) => {
            println!("❌ {} 无效", file.display());
            for violation in e.violations() {
                println!("   - {}: {}", violation.field, violation.reason);
            }
            anyhow::bail!("configuration rejected: {}", e)
        }
    }
}

async fn probe(json: bool) -> Result<()> {
    let stats = tokio::task::spawn_blocking(|| {
        let mut probe = SystemProbe::new();
        // CPU 使用率需要两次刷新的差值
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        probe.sample()
    })
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let formatted = format_system_stats(&stats);
    println!("CPU:    {} ({})", formatted.cpu.usage, formatted.cpu.temperature);
    println!(
        "内存:   {} / {} ({})",
        formatted.memory.used, formatted.memory.total, formatted.memory.percentage
    );
    println!(
        "磁盘:   {} / {} ({})",
        formatted.disk.used, formatted.disk.total, formatted.disk.percentage
    );
    println!("网络:   rx {} / tx {}", formatted.network.rx, formatted.network.tx);
    println!("运行:   {}", formatted.uptime);
    Ok(())
}
