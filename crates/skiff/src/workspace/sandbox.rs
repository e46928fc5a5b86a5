use std::sync::Arc;
use std::time::Duration;

use dockside::{Container, ContainerSpec, ContainerState};
use skiff_db_schema::Schema;
use tracing::{info, warn};

use super::{CleanupAction, Options, TempSchema, Workspace};
use crate::instance::{Instance, SessionParams};
use crate::shutdown::ShutdownArgs;
use crate::traced::TracedPool;
use crate::{BoxFuture, Error, Result};

/// Password given to the superuser of containers we create.
const DEFAULT_ROOT_PASSWORD: &str = "skiff";

const POSTGRES_PORT: u16 = 5432;
const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Container name used for `image` when none is configured:
/// `postgres:16-alpine` becomes `skiff-postgres-16-alpine`.
pub fn container_name_for_image(image: &str) -> String {
    format!("skiff-{}", image.replace([':', '/'], "-"))
}

/// A scratch database inside a local docker container.
///
/// The container is found by name and reused across workspaces (and across
/// runs). Cleanup only drops the scratch database; stopping or removing the
/// container is registered with the shutdown registry instead.
pub struct Sandbox {
    container_name: String,
    inner: TempSchema,
}

impl Sandbox {
    pub(super) async fn new(opts: &Options) -> Result<Self> {
        let image = opts
            .image
            .clone()
            .ok_or_else(|| Error::Config("docker workspace requires image".to_string()))?;
        let registry = opts
            .shutdown
            .clone()
            .ok_or_else(|| Error::Config("docker workspace requires shutdown".to_string()))?;
        let container_name = opts
            .container_name
            .clone()
            .unwrap_or_else(|| container_name_for_image(&image));
        let password = opts
            .root_password
            .clone()
            .unwrap_or_else(|| DEFAULT_ROOT_PASSWORD.to_string());

        let port = {
            let name = container_name.clone();
            let password = password.clone();
            tokio::task::spawn_blocking(move || start_container(&image, &name, &password))
                .await??
        };

        let instance = Arc::new(Instance::new(
            "127.0.0.1",
            port,
            "postgres",
            Some(password),
        ));
        instance.wait_until_ready(STARTUP_TIMEOUT).await?;

        match opts.cleanup_action {
            CleanupAction::StopSandbox | CleanupAction::DestroySandbox => {
                let destroy = opts.cleanup_action == CleanupAction::DestroySandbox;
                let name = container_name.clone();
                registry.register_unique(container_name.clone(), move |args: &ShutdownArgs| {
                    teardown_container(&name, destroy, args)
                });
            }
            _ => {}
        }

        let inner = TempSchema::provision(
            instance,
            opts,
            CleanupAction::DropSchema,
            opts.default_conn_params.clone(),
        )
        .await?;

        Ok(Self {
            container_name,
            inner,
        })
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }
}

/// Find, start or create the container. Returns the host port postgres is
/// published on.
fn start_container(image: &str, name: &str, password: &str) -> dockside::Result<u16> {
    let container = match Container::find(name)? {
        Some(container) => {
            if container.state()? != ContainerState::Running {
                info!(container = name, "starting sandbox container");
                container.start()?;
            }
            container
        }
        None => {
            info!(container = name, image, "creating sandbox container");
            Container::run(
                ContainerSpec::new(image)
                    .named(name)
                    .env("POSTGRES_PASSWORD", password)
                    .port(POSTGRES_PORT),
            )?
        }
    };
    container.wait_for_port(POSTGRES_PORT, STARTUP_TIMEOUT)
}

/// Shutdown function body. The first argument, when given, is a name prefix:
/// containers not matching it are left alone (and stay registered).
fn teardown_container(name: &str, destroy: bool, args: &ShutdownArgs) -> bool {
    if let Some(prefix) = args.first()
        && !name.starts_with(prefix.as_str())
    {
        return false;
    }
    let container = match Container::find(name) {
        Ok(Some(container)) => container,
        Ok(None) => return true,
        Err(e) => {
            warn!(container = name, "cannot look up sandbox container: {}", e);
            return false;
        }
    };
    let result = if destroy {
        info!(container = name, "removing sandbox container");
        container.remove()
    } else {
        info!(container = name, "stopping sandbox container");
        container.stop()
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(container = name, "sandbox teardown failed: {}", e);
            false
        }
    }
}

impl Workspace for Sandbox {
    fn connection_pool<'a>(
        &'a self,
        params: &'a SessionParams,
    ) -> BoxFuture<'a, Result<TracedPool>> {
        self.inner.connection_pool(params)
    }

    fn introspect_schema(&self) -> BoxFuture<'_, Result<Schema>> {
        self.inner.introspect_schema()
    }

    fn cleanup(&self) -> BoxFuture<'_, Result<()>> {
        self.inner.cleanup()
    }
}
