use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // 网络配置
    pub ws_host: String,
    pub ws_path: String,
    pub ws_secure: bool,
    pub token_env: String,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,

    // 音频配置
    pub capture_device: String,
    pub playback_device: String,
    pub send_sample_rate: u32,
    pub receive_sample_rate: u32,
    pub capture_block_size: usize,
    pub playback_period_size: usize,
    pub speaking_threshold: u8,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            ws_host: env!("WS_HOST").to_string(),
            ws_path: env!("WS_PATH").to_string(),
            ws_secure: env!("WS_SECURE").parse()
                .map_err(|_| "Failed to parse WS_SECURE")?,
            token_env: env!("TOKEN_ENV").to_string(),
            reconnect_max_attempts: env!("RECONNECT_MAX_ATTEMPTS").parse()
                .map_err(|_| "Failed to parse RECONNECT_MAX_ATTEMPTS")?,
            reconnect_base_delay: Duration::from_millis(
                env!("RECONNECT_BASE_DELAY_MS").parse()
                    .map_err(|_| "Failed to parse RECONNECT_BASE_DELAY_MS")?,
            ),

            capture_device: env!("CAPTURE_DEVICE").to_string(),
            playback_device: env!("PLAYBACK_DEVICE").to_string(),
            send_sample_rate: env!("SEND_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse SEND_SAMPLE_RATE")?,
            receive_sample_rate: env!("RECEIVE_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse RECEIVE_SAMPLE_RATE")?,
            capture_block_size: env!("CAPTURE_BLOCK_SIZE").parse()
                .map_err(|_| "Failed to parse CAPTURE_BLOCK_SIZE")?,
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,
            speaking_threshold: env!("SPEAKING_THRESHOLD").parse()
                .map_err(|_| "Failed to parse SPEAKING_THRESHOLD")?,
        })
    }

    /// Config pointing at an explicit endpoint, everything else at the usual
    /// call defaults. Used when the endpoint is only known at runtime.
    pub fn for_endpoint(host: impl Into<String>, path: impl Into<String>, secure: bool) -> Self {
        Self {
            ws_host: host.into(),
            ws_path: path.into(),
            ws_secure: secure,
            token_env: "CARECALL_ACCESS_TOKEN".to_string(),
            reconnect_max_attempts: 5,
            reconnect_base_delay: Duration::from_millis(1000),
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            send_sample_rate: 16000,
            receive_sample_rate: 24000,
            capture_block_size: 4096,
            playback_period_size: 1024,
            speaking_threshold: 30,
        }
    }
}
