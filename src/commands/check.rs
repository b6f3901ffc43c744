use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::ListParams;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use crate::cli::{NatsArgs, StoreArgs};
use kube_activity::broker::{
    self, ACTIVITY_STREAM, AUDIT_STREAM, BrokerHealth, DLQ_STREAM, EVENT_STREAM, REINDEX_STREAM,
};
use kube_activity::crd::ActivityPolicy;
use kube_activity::store::{ActivityStore, StoreConfig};

pub async fn run(nats: &NatsArgs, store: &StoreArgs) -> anyhow::Result<()> {
    println!("Running pre-flight checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            Some(c)
        }
        Err(e) => {
            println!("FAIL ({e})");
            None
        }
    };

    if let Some(client) = &client {
        // 2. Verify actual cluster connectivity by fetching server version
        print!("  Cluster connection .......... ");
        match client.apiserver_version().await {
            Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
            Err(e) => {
                println!("FAIL");
                println!("\n  Error: {e}");
                println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            }
        }

        // 3. CRD registration
        print!("  CRD registration ............ ");
        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        let mut missing = Vec::new();
        for name in [
            "activitypolicies.activity.platform.io",
            "reindexjobs.activity.platform.io",
        ] {
            if crds.get_opt(name).await.ok().flatten().is_none() {
                missing.push(name);
            }
        }
        if missing.is_empty() {
            println!("OK");
        } else {
            println!("MISSING ({})", missing.join(", "));
            println!("  Hint:  Install with: kube-activity crd install");
        }

        // 4. Ready policies
        print!("  Ready policies .............. ");
        let policies: Api<ActivityPolicy> = Api::all(client.clone());
        match policies.list(&ListParams::default()).await {
            Ok(list) => {
                let ready = list.items.iter().filter(|p| p.is_ready()).count();
                println!("OK ({ready} of {} policies Ready)", list.items.len());
            }
            Err(e) => println!("FAIL ({e})"),
        }
    }

    // 5. Broker connectivity and stream presence
    print!("  Broker connection ........... ");
    let shutdown = CancellationToken::new();
    match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        broker::connect(&nats.nats_url, BrokerHealth::new(), shutdown),
    )
    .await
    {
        Ok(Ok(nats_client)) => {
            println!("OK ({})", nats.nats_url);

            print!("  Broker streams .............. ");
            let js = async_nats::jetstream::new(nats_client);
            let mut missing = Vec::new();
            for stream in [
                AUDIT_STREAM,
                EVENT_STREAM,
                ACTIVITY_STREAM,
                REINDEX_STREAM,
                DLQ_STREAM,
            ] {
                if js.get_stream(stream).await.is_err() {
                    missing.push(stream);
                }
            }
            if missing.is_empty() {
                println!("OK (5 streams)");
            } else {
                println!("MISSING ({})", missing.join(", "));
                println!("  Hint:  The processor provisions streams on startup");
            }
        }
        Ok(Err(e)) => println!("FAIL ({e})"),
        Err(_) => println!("FAIL (timed out after 5s)"),
    }

    // 6. Analytical store
    print!("  Store connection ............ ");
    let activity_store = ActivityStore::connect(&StoreConfig {
        url: store.clickhouse_url.clone(),
        database: store.clickhouse_database.clone(),
        user: store.clickhouse_user.clone(),
        password: store.clickhouse_password.clone(),
    });
    match activity_store.ping().await {
        Ok(()) => println!("OK ({})", store.clickhouse_url),
        Err(e) => println!("FAIL ({e})"),
    }

    println!("\nAll checks completed.");
    Ok(())
}
