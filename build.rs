use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    audio: Audio,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    ws_host: String,
    ws_path: String,
    secure: bool,
    token_env: String,
    reconnect_max_attempts: u32,
    reconnect_base_delay_ms: u64,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    send_sample_rate: u32,
    receive_sample_rate: u32,
    capture_block_size: usize,
    playback_period_size: usize,
    speaking_threshold: u8,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=WS_HOST={}", config.network.ws_host);
    println!("cargo:rustc-env=WS_PATH={}", config.network.ws_path);
    println!("cargo:rustc-env=WS_SECURE={}", config.network.secure);
    println!("cargo:rustc-env=TOKEN_ENV={}", config.network.token_env);
    println!(
        "cargo:rustc-env=RECONNECT_MAX_ATTEMPTS={}",
        config.network.reconnect_max_attempts
    );
    println!(
        "cargo:rustc-env=RECONNECT_BASE_DELAY_MS={}",
        config.network.reconnect_base_delay_ms
    );

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=SEND_SAMPLE_RATE={}", config.audio.send_sample_rate);
    println!("cargo:rustc-env=RECEIVE_SAMPLE_RATE={}", config.audio.receive_sample_rate);
    println!("cargo:rustc-env=CAPTURE_BLOCK_SIZE={}", config.audio.capture_block_size);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", config.audio.playback_period_size);
    println!("cargo:rustc-env=SPEAKING_THRESHOLD={}", config.audio.speaking_threshold);
}
