//! # KMI Rotor 主程序

use clap::Parser;
use kmi_rotor::{
    Result,
    config::ConfigManager,
    error::Context,
    key_pool::{ConfigKeyProvider, KeyProvider},
    lerror, linfo,
    logging::{self, LogComponent, LogStage},
    proxy::{ProxyContext, ProxyServer},
    state::StateStore,
};
use std::path::PathBuf;
use std::sync::Arc;

/// 命令行参数
#[derive(Debug, Parser)]
#[command(name = "kmi-rotor", version, about = "Credential-rotating reverse proxy")]
struct Args {
    /// 配置文件路径，缺省时读取 KMI_CONFIG_PATH
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 演练模式：不访问上游
    #[arg(long)]
    dry_run: bool,

    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,

    /// 打印日志配置指南后退出
    #[arg(long)]
    logging_help: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.logging_help {
        logging::print_logging_help();
        return;
    }

    if let Err(e) = run(args).await {
        lerror!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "service_start_failed",
            "服务启动失败",
            error = %e
        );
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let manager = ConfigManager::load(args.config.as_deref())?;
    let mut config = (*manager.config()).clone();
    if args.dry_run {
        config.dry_run = true;
    }
    logging::init_logging(Some(args.log_level.as_deref().unwrap_or(&config.log_level)));

    let provider = ConfigKeyProvider::new(&config);
    let registry = provider.load_registry().await?;
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "registry_loaded",
        "密钥注册表已加载",
        provider = provider.name(),
        keys = registry.len()
    );

    let store = StateStore::new(config.state_path());
    let state = {
        let registry = registry.clone();
        tokio::task::spawn_blocking(move || store.load(&registry))
            .await?
            .context("加载轮换状态失败")?
    };

    let ctx = Arc::new(ProxyContext::new(Arc::new(config), registry, state)?);
    ProxyServer::new(ctx)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                lerror!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::Main,
                    "signal_listen_failed",
                    "监听停机信号失败",
                    error = %e
                );
            }
        })
        .await?;

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Main,
        "service_shutdown",
        "服务正常关闭"
    );
    Ok(())
}
