use std::time::Duration;

use clap::Parser;
use twisp_clock::{Clock, DurationSecs, System};
use twisp_tokens::{
    backoff::ErrorBackoffConfig,
    generators::{exchange::EnvironmentIdentity, ExchangeTokenGenerator},
    Environment, Region, RefresherConfig, RoleArn, TokenRefresher, TokenStatus, TtlRefresher,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The region hosting the issuer
    #[arg(short, long, env = "TWISP_REGION")]
    region: Region,

    /// The deployment environment of the issuer
    #[arg(short, long, env = "TWISP_ENVIRONMENT", default_value = "cloud")]
    environment: Environment,

    /// A role to assume while proving identity
    #[arg(long, env = "TWISP_ASSUME_ROLE_ARN")]
    assume_role_arn: Option<RoleArn>,

    /// The variable holding the identity proof
    #[arg(long, default_value = EnvironmentIdentity::DEFAULT_VAR)]
    identity_var: String,

    /// Seconds before expiry at which a token stops being handed out
    #[arg(long, default_value_t = 30)]
    max_token_age: u64,

    /// Seconds before expiry at which a background renewal is attempted
    #[arg(long, default_value_t = 300)]
    max_refresh_age: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder().https_only(true).build()?;

    let mut generator = ExchangeTokenGenerator::new(
        client,
        &opts.environment,
        opts.region,
        EnvironmentIdentity::new(opts.identity_var),
    )?;

    if let Some(role) = opts.assume_role_arn {
        generator = generator.with_assume_role(role);
    }

    let config = RefresherConfig::new(
        DurationSecs(opts.max_token_age),
        DurationSecs(opts.max_refresh_age),
    )
    .with_error_backoff(ErrorBackoffConfig::default())
    .with_prefetch(true);

    let refresher = TtlRefresher::spawn(generator, config);

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let token = match refresher.token().await {
            Ok(token) => token,
            Err(error) => {
                tracing::error!(
                    error = (&error as &dyn std::error::Error),
                    "unable to obtain token"
                );
                continue;
            }
        };

        let status = token.token_status_at(System.now());
        match status {
            TokenStatus::Fresh => tracing::debug!(
                ?status,
                refreshed = token.was_refreshed(),
                generation = token.generation(),
                expiry = token.expiry().0,
                "pulled token"
            ),
            TokenStatus::RefreshDue | TokenStatus::Stale => tracing::warn!(
                ?status,
                refreshed = token.was_refreshed(),
                generation = token.generation(),
                expiry = token.expiry().0,
                "pulled token"
            ),
        }
    }

    refresher.stop();
    Ok(())
}
