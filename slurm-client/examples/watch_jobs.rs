//! List jobs and follow their state changes
//!
//! Reads `SLURM_REST_URL`, `SLURM_API_VERSION` and friends from the environment;
//! the token comes from `SLURM_JWT` (`scontrol token`).

use slurm_client::{
    CancellationToken, ClientConfig, ClientFactoryBuilder, ListQuery, ResourceKind, TokenAuth,
    WatchOptions,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = ClientFactoryBuilder::from_config(ClientConfig::from_env());
    if let Ok(token) = std::env::var("SLURM_JWT") {
        let auth = match std::env::var("USER") {
            Ok(user) => TokenAuth::new(token).with_user(user),
            Err(_) => TokenAuth::new(token),
        };
        builder = builder.auth(auth);
    }
    let factory = builder.build()?;

    let cancel = CancellationToken::new();
    let client = factory.new_client(&cancel).await?;
    println!("bound to {}", client.version());

    let jobs = client
        .list(ResourceKind::Jobs, &ListQuery::new().limit(20), &cancel)
        .await?;
    for job in &jobs {
        println!("{:>10}  {}", job.id, job.state.as_deref().unwrap_or("-"));
    }

    let mut session = client.watch(
        ResourceKind::Jobs,
        WatchOptions::new().interval(Duration::from_secs(10)).max_events(10),
        &cancel,
    )?;
    while let Some(event) = session.next().await {
        println!(
            "{:>10}  {:<12} {} -> {}",
            event.id,
            event.label,
            event.previous_state.as_deref().unwrap_or("-"),
            event.current_state.as_deref().unwrap_or("-"),
        );
    }
    println!("watch ended: {}", session.join().await);

    factory.close();
    Ok(())
}
