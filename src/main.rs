//! Dealflow 驱动程序
//!
//! 从 stdin 逐行读取 JSON 命令（extracted / force / offer / executed），出站事件以 JSON 行写到 stdout；
//! 后台定期回收不活跃的推理上下文；Ctrl+C / SIGTERM / stdin 关闭时退出。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dealflow::config::load_config;
use dealflow::core::{ShutdownManager, ShutdownReason};
use dealflow::{Pipeline, PipelineCommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dealflow::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    let gc_interval = Duration::from_secs(config.reasoning.gc_interval_secs.max(1));

    let pipeline = Arc::new(
        Pipeline::builder(config)
            .build()
            .context("Invalid configuration")?,
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    // 出站事件 → stdout
    let mut rx = pipeline.subscribe();
    let token = shutdown.token();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                    },
                    Err(RecvError::Lagged(n)) => tracing::warn!("Event printer lagged, {} events dropped", n),
                    Err(RecvError::Closed) => break,
                },
                _ = token.cancelled() => break,
            }
        }
    });

    // 推理上下文 GC
    let gc_pipeline = Arc::clone(&pipeline);
    let token = shutdown.token();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(gc_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    gc_pipeline.collect_garbage(chrono::Utc::now());
                }
            }
        }
    });

    tracing::info!("dealflow ready, reading commands from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let token = shutdown.token();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<PipelineCommand>(line) {
                        Ok(command) => {
                            pipeline.dispatch(command).await;
                        }
                        Err(e) => tracing::warn!("Skipping malformed command: {}", e),
                    }
                }
                Ok(None) => {
                    shutdown.shutdown(ShutdownReason::InputClosed);
                    break;
                }
                Err(e) => {
                    shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
                    break;
                }
            }
        }
    }

    let _ = printer.await;
    tracing::info!("dealflow stopped");
    Ok(())
}
