use std::sync::Arc;

use carecall::auth::EnvToken;
use carecall::{CallCommand, CallController, CallDevices, CallState, CallView, Config};
use tokio::signal;
use tokio::sync::mpsc;

#[cfg(feature = "alsa")]
fn devices(config: &Config) -> anyhow::Result<CallDevices> {
    use carecall::audio::{AlsaCapture, AlsaPlayback};

    Ok(CallDevices {
        capture: Arc::new(AlsaCapture::new(&config.capture_device)),
        output: Arc::new(AlsaPlayback::new(
            &config.playback_device,
            config.playback_period_size,
        )),
    })
}

#[cfg(not(feature = "alsa"))]
fn devices(_config: &Config) -> anyhow::Result<CallDevices> {
    anyhow::bail!("built without an audio backend, enable the `alsa` feature")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().map_err(anyhow::Error::msg)?;
    log::info!(
        "{} {} -> {}{}",
        env!("APP_NAME"),
        env!("APP_VERSION"),
        config.ws_host,
        config.ws_path
    );

    let token = Arc::new(EnvToken::new(config.token_env.clone()));
    let devices = devices(&config)?;

    let (controller, mut view_rx) = CallController::new(config, token, devices);
    let (tx_cmd, rx_cmd) = mpsc::channel::<CallCommand>(4);
    let mut call = tokio::spawn(controller.run(rx_cmd));

    let mut last = view_rx.borrow().clone();
    let last_view = loop {
        tokio::select! {
            // 监听 Ctrl+C 信号，挂断通话
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, hanging up...");
                if let Err(e) = tx_cmd.send(CallCommand::End).await {
                    log::error!("Failed to send hang-up: {}", e);
                }
            }

            // 通话结束
            result = &mut call => break result?,

            Ok(()) = view_rx.changed() => {
                let view = view_rx.borrow_and_update().clone();
                report(&last, &view);
                last = view;
            }
        }
    };

    report(&last, &last_view);
    if last_view.state != CallState::Ended {
        log::warn!("Call task returned before ending: {}", last_view.status);
    }
    Ok(())
}

/// Print what changed between two snapshots of the call.
fn report(prev: &CallView, next: &CallView) {
    if prev.status != next.status {
        println!("[status] {}", next.status);
    }
    if prev.speaking != next.speaking {
        println!("[mic] {}", if next.speaking { "speaking" } else { "quiet" });
    }

    let entries = next.transcript.entries();
    for (i, entry) in entries.iter().enumerate() {
        let before = prev.transcript.entries().get(i);
        if before.is_some_and(|b| b == entry) {
            continue;
        }
        if entry.final_ {
            println!("[{:?}] {}", entry.speaker, entry.text);
        }
    }

    if next.duration_secs != prev.duration_secs && next.duration_secs % 30 == 0 {
        log::info!(
            "Call duration {:02}:{:02}",
            next.duration_secs / 60,
            next.duration_secs % 60
        );
    }
}
