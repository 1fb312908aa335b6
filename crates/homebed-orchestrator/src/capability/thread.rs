//! Thread radio capability.

use tracing::info;

use super::{ContainerHints, ResourceCapability};
use crate::context::HostContext;
use crate::error::{Result, TeardownReport};
use crate::radio::{PipePair, RadioMode, VirtualRadioLink};

/// Where the device sees its radio.
pub const THREAD_DEVICE_PATH: &str = "/dev/ttyUSB0";

/// Environment variable exposing the link's port offset to the device.
pub const THREAD_PORT_OFFSET_ENV: &str = "THREAD_PORT_OFFSET";

/// A virtual Thread radio attached to one device.
#[derive(Debug)]
pub struct ThreadCapability {
    link: VirtualRadioLink,
}

impl ThreadCapability {
    /// Opens a radio link for `device_id`.
    pub fn enable(ctx: &HostContext, device_id: &str, mode: RadioMode) -> Result<Self> {
        Self::from_link(VirtualRadioLink::new(ctx, device_id, None, mode))
    }

    /// Like [`enable`](Self::enable), over a caller-provided pipe pair.
    pub fn enable_with_pipe(
        ctx: &HostContext,
        device_id: &str,
        mode: RadioMode,
        pipe: Box<dyn PipePair>,
    ) -> Result<Self> {
        Self::from_link(VirtualRadioLink::new(ctx, device_id, None, mode).with_pipe(pipe))
    }

    fn from_link(mut link: VirtualRadioLink) -> Result<Self> {
        link.open()?;
        info!(device = %link.device_id(), petition = link.petition_id(), "Thread radio attached");
        Ok(Self { link })
    }

    /// Returns the underlying link.
    pub fn link(&self) -> &VirtualRadioLink {
        &self.link
    }
}

impl ResourceCapability for ThreadCapability {
    fn name(&self) -> &'static str {
        "Thread"
    }

    fn container_hints(&self) -> ContainerHints {
        match self.link.user_pipe() {
            Some(user) => ContainerHints::new()
                .device(format!("{}:{THREAD_DEVICE_PATH}", user.display()))
                .env(THREAD_PORT_OFFSET_ENV, self.link.port_offset().to_string()),
            None => ContainerHints::new(),
        }
    }

    fn disable(&mut self) -> TeardownReport {
        self.link.close()
    }
}
