use crate::config::DaemonConfig;
use crate::error::RbdVolError;
use crate::logging::Logger;
use crate::volume::VolumePlugin;
use clap::Args;
use tracing::info;

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub config: DaemonConfig,

    #[command(flatten)]
    pub logger: Logger,
}

pub async fn serve(args: ServeArgs) -> Result<(), RbdVolError> {
    args.logger.init()?;
    info!(
        pool = %args.config.pool,
        mount_root = ?args.config.mount_root,
        remove_action = ?args.config.remove_action,
        can_create = args.config.can_create,
        "starting rbd volume plugin"
    );
    VolumePlugin::new(args.config).run().await
}
