use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber; `LOG_FORMAT=json` selects structured output
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,actix_server=warn,aws_config=warn,aws_smithy_runtime=warn,aws_sdk_s3=warn,aws_sdk_sns=warn")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        fmt().json().with_env_filter(env_filter).init();
    } else {
        fmt().with_env_filter(env_filter).init();
    }
}
