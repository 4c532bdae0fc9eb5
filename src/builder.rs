//! Type-state builder for [`Engine`], grounded on
//! `examples/MazinLab-jpe/src/builder.rs`'s `BaseContextBuilder<T>`
//! pattern: the transport choice is encoded in the type so `build()` is
//! only callable once a link has actually been configured.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, GatewayResult};
use crate::link::{tcp::TcpLink, LinkOpen, LinkStatus};
use crate::sink::ContentSink;

pub struct Init;
pub struct Serial;
pub struct Network;

/// Type-state builder for an [`Engine`].
pub struct EngineBuilder<T> {
    device: Option<String>,
    baud: Option<u32>,
    config: Config,
    sink: Option<Arc<dyn ContentSink>>,
    _marker: PhantomData<T>,
}

impl EngineBuilder<Init> {
    pub fn new(config: Config) -> Self {
        Self {
            device: None,
            baud: None,
            config,
            sink: None,
            _marker: PhantomData,
        }
    }

    /// Continues towards building over a local serial device.
    #[cfg(feature = "serial")]
    pub fn with_serial(self, device: &str) -> EngineBuilder<Serial> {
        EngineBuilder {
            device: Some(device.to_string()),
            baud: Some(crate::link::serial::DEFAULT_BAUD),
            config: self.config,
            sink: self.sink,
            _marker: PhantomData,
        }
    }

    /// Continues towards building over a TCP-bridged serial adapter,
    /// `addr` in `host:port` form.
    pub fn with_network(self, addr: &str) -> EngineBuilder<Network> {
        EngineBuilder {
            device: Some(addr.to_string()),
            baud: None,
            config: self.config,
            sink: self.sink,
            _marker: PhantomData,
        }
    }
}

impl<T> EngineBuilder<T> {
    /// Installs the sink that receives decoded `Log` text and `Proc`
    /// snapshots. Defaults to a [`crate::sink::ChannelSink`] with its
    /// receiver discarded if never called.
    pub fn with_sink(mut self, sink: Arc<dyn ContentSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

#[cfg(feature = "serial")]
impl EngineBuilder<Serial> {
    pub fn baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    pub fn build(self) -> GatewayResult<Engine> {
        let device = self.device.expect("serial device set by with_serial");
        let baud = self.baud.expect("baud defaulted by with_serial");
        match crate::link::serial::SerialLink::open_with_baud(&device, baud) {
            LinkStatus::Ready(link) => Ok(spawn(link, self.config, self.sink)),
            LinkStatus::Err(e) => Err(Error::LinkOpenFailed(e.to_string())),
            LinkStatus::Pending => Err(Error::LinkOpenFailed(
                "serial open did not complete synchronously".to_string(),
            )),
        }
    }
}

impl EngineBuilder<Network> {
    pub fn build(self) -> GatewayResult<Engine> {
        let addr = self.device.expect("address set by with_network");
        match TcpLink::open(&addr) {
            LinkStatus::Ready(link) => Ok(spawn(link, self.config, self.sink)),
            LinkStatus::Err(e) => Err(Error::LinkOpenFailed(e.to_string())),
            LinkStatus::Pending => Err(Error::LinkOpenFailed(
                "network connect did not complete synchronously".to_string(),
            )),
        }
    }
}

fn spawn<L: crate::link::Link + 'static>(
    link: L,
    config: Config,
    sink: Option<Arc<dyn ContentSink>>,
) -> Engine {
    let sink = sink.unwrap_or_else(|| {
        let (sink, _receiver_discarded) = crate::sink::ChannelSink::new();
        Arc::new(sink)
    });
    Engine::spawn(link, config, sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ChannelSink;

    #[test]
    fn network_build_fails_fast_on_unparseable_address() {
        let result = EngineBuilder::new(Config::new("unused"))
            .with_network("not-an-address")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn network_build_fails_when_nothing_listens() {
        let (sink, _rx) = ChannelSink::new();
        let result = EngineBuilder::new(Config::new("unused"))
            .with_network("127.0.0.1:1")
            .with_sink(Arc::new(sink))
            .build();
        assert!(result.is_err());
    }
}
