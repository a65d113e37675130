use crate::config::AppConfig;

pub const SERVICE_NAME: &str = "framefeed";

pub fn setup_logging(config: &AppConfig) {
    common::setup_logging(config.log_level, config.environment, SERVICE_NAME);
}
