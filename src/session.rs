use crate::error::{Error, Result};
use crate::memory::GuestView;
use crate::platform::Platform;

use memflow::prelude::v1::*;

use log::*;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Connector target, e.g. the VM name.
    pub target: String,
    /// memflow connector plugin, e.g. `kvm` or `qemu`.
    pub connector: String,
    /// Kernel directory table base (CR3).
    pub dtb: Address,
    pub platform: Platform,
}

/// Introspection session on one target.
///
/// Owns the connector. Dropping the session releases it, on every path.
pub struct Session<V> {
    target: String,
    platform: Platform,
    kernel: GuestView<V>,
}

impl<V: MemoryView> Session<V> {
    pub fn new(target: &str, platform: Platform, view: V) -> Self {
        Self {
            target: target.to_string(),
            platform,
            kernel: GuestView::new(view, platform.pointer_width()),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Reader over kernel virtual memory.
    pub fn kernel(&mut self) -> &mut GuestView<V> {
        &mut self.kernel
    }
}

impl<V> Drop for Session<V> {
    fn drop(&mut self) {
        info!("releasing session for {}", self.target);
    }
}

/// Creates the connector through the plugin inventory and builds a kernel
/// view on top of it.
pub fn attach(config: &SessionConfig) -> Result<Session<impl MemoryView>> {
    let init = |err: memflow::error::Error| Error::Init {
        target: config.target.clone(),
        err,
    };

    let mut inventory = Inventory::scan();

    let args = str::parse::<ConnectorArgs>(&config.target).map_err(init)?;
    let connector = inventory
        .create_connector(&config.connector, None, Some(&args))
        .map_err(init)?;

    info!(
        "attached {} connector to {} (dtb {:x}, {})",
        config.connector, config.target, config.dtb, config.platform
    );

    let view = VirtualDma::new(
        connector,
        config.platform.arch(),
        config.platform.translator(config.dtb),
    );

    Ok(Session::new(&config.target, config.platform, view))
}
