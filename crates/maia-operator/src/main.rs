use std::sync::Arc;

use futures::StreamExt;
use kube::Client;
use kube::runtime::events::{Recorder, Reporter};
use maia_operator::config::{LogOutput, OperatorConfig};
use maia_operator::leader::LeaderElector;
use maia_operator::{instance_controller as inst, tenant_controller as tnt};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::from_env()?;

    // Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_output {
        LogOutput::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogOutput::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }

    info!(
        identity = %config.pod_name,
        watch_namespace = ?config.watch_namespace,
        "maia-operator starting up"
    );

    let client = Client::try_default().await?;

    let elector = config.leader_election.then(|| {
        LeaderElector::new(
            client.clone(),
            &config.operator_namespace,
            config.lease_name.clone(),
            config.pod_name.clone(),
            config.lease_duration,
        )
    });
    if let Some(elector) = &elector {
        elector.acquire().await?;
    }
    let lease = async {
        match &elector {
            Some(e) => e.hold().await,
            None => std::future::pending().await,
        }
    };

    let reporter = Reporter {
        controller: "maia-operator".into(),
        instance: Some(config.pod_name.clone()),
    };
    let watch_ns = config.watch_namespace.as_deref();

    // Instance controller
    let inst_ctx = Arc::new(inst::Ctx {
        client: client.clone(),
        recorder: Recorder::new(client.clone(), reporter.clone()),
        watch_namespace: config.watch_namespace.clone(),
    });
    let inst_controller = inst::controller(client.clone(), watch_ns)
        .run(inst::reconcile, inst::error_policy, inst_ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                tracing::warn!(error=?e, "instance reconcile error");
            }
        });

    // Tenant controller
    let tnt_ctx = Arc::new(tnt::Ctx {
        client: client.clone(),
        recorder: Recorder::new(client.clone(), reporter),
        admin_timeout: config.admin_timeout,
    });
    let tnt_controller = tnt::controller(client.clone(), watch_ns)
        .run(tnt::reconcile, tnt::error_policy, tnt_ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                tracing::warn!(error=?e, "tenant reconcile error");
            }
        });

    tokio::select! {
        _ = inst_controller => {},
        _ = tnt_controller => {},
        res = lease => {
            res?;
            anyhow::bail!("leadership lost");
        }
        _ = tokio::signal::ctrl_c() => { info!("shutdown signal received"); }
    }
    Ok(())
}
