mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction, ReindexAction, WebhookAction};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Check { nats, store } => commands::check::run(&nats, &store).await?,
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::Processor {
            nats,
            workers,
            batch_size,
            audit_consumer,
            event_consumer,
            disable_dlq,
        } => {
            commands::processor::run(
                &nats,
                workers,
                batch_size,
                &audit_consumer,
                &event_consumer,
                disable_dlq,
            )
            .await?;
        }
        Commands::Reconcile {
            nats,
            store,
            worker_image,
            worker_namespace,
            max_concurrent,
        } => {
            commands::reconcile::run(&nats, &store, &worker_image, &worker_namespace, max_concurrent)
                .await?;
        }
        Commands::ReindexWorker { job, nats, store } => {
            commands::reindex_worker::run(&job, &nats, &store).await?;
        }
        Commands::Reindex { action } => match action {
            ReindexAction::Create {
                name,
                start,
                end,
                policies,
                batch_size,
                rate_limit,
                dry_run,
                ttl,
            } => {
                commands::reindex::create(
                    &name, &start, end, policies, batch_size, rate_limit, dry_run, ttl,
                )
                .await?;
            }
            ReindexAction::Status { name, watch } => {
                commands::reindex::status(&name, watch).await?;
            }
            ReindexAction::List => commands::reindex::list().await?,
        },
        Commands::Webhook { action } => match action {
            WebhookAction::Serve {
                addr,
                tls_cert,
                tls_key,
            } => commands::webhook::serve(&addr, &tls_cert, &tls_key).await?,
            WebhookAction::CertGenerate {
                service_name,
                namespace,
                output_dir,
            } => commands::webhook::generate_certs(&service_name, &namespace, &output_dir)?,
            WebhookAction::InstallConfig {
                service_name,
                namespace,
                ca_bundle_path,
            } => commands::webhook::install_config(&service_name, &namespace, &ca_bundle_path)?,
        },
    }

    Ok(())
}
