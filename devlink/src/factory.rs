//! Transport factory.
//!
//! A factory turns transport options into an assembled [`Connection`]: the
//! transport, a pipeline in the fixed stage order, one deliverability
//! manager, one query manager, and the reporters, all sharing one connection
//! context. The pipeline is finalized before the connection is returned.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::codec::{Codec, CodecRegistry};
use crate::config::{Config, LinkConfig};
use crate::connection::{Connection, ConnectionContext};
use crate::deliverability::DeliverabilityManager;
use crate::error::Result;
use crate::hint::ConnectionId;
use crate::metadata::{HeartbeatReporter, MetadataReporter, StaticReporter};
use crate::pipeline::{
    BinaryStage, CodecStage, FragmentStage, FramingStage, MessageIdGuardStage, PipelineBuilder,
    TypeCacheStage,
};
use crate::protocol::{MessageId, TypeTag};
use crate::query::QueryManager;
use crate::tracing::prelude::*;
use crate::transport::TransportOptions;
use crate::type_cache::TypeCache;

/// Everything a factory needs to know about one kind of link.
#[derive(Debug, Clone)]
pub struct TransportProfile {
    pub link: LinkConfig,
    pub allowed: Vec<MessageId>,
    pub codecs: CodecRegistry,
    pub error_if_no_match: bool,
    pub static_types: BTreeMap<MessageId, TypeTag>,
    pub handshake_timeout: Duration,
}

impl TransportProfile {
    /// Profile using `link` and the shared protocol settings, with only the
    /// built-in codecs.
    pub fn from_config(config: &Config, link: &LinkConfig) -> Self {
        Self {
            link: link.clone(),
            allowed: config.protocol.allowed(),
            codecs: CodecRegistry::with_defaults([]),
            error_if_no_match: config.protocol.error_if_no_codec_match,
            static_types: config.protocol.static_types(),
            handshake_timeout: config.protocol.handshake_timeout(),
        }
    }

    /// Append custom codecs after the built-in ones.
    pub fn with_codecs(mut self, codecs: impl IntoIterator<Item = Arc<dyn Codec>>) -> Self {
        self.codecs.add_codecs(codecs);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TransportFactory {
    profile: TransportProfile,
}

impl TransportFactory {
    pub fn new(profile: TransportProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &TransportProfile {
        &self.profile
    }

    /// Assemble a connection. Fails with a construction error if any stage
    /// cannot be initialized.
    pub fn build(
        &self,
        identity: ConnectionId,
        options: TransportOptions,
        shutdown: CancellationToken,
    ) -> Result<Connection> {
        let profile = &self.profile;
        let cache = TypeCache::seeded(profile.static_types.iter());

        let pipeline = PipelineBuilder::new()
            .stage(FramingStage::new(profile.link.max_frame_length))
            .stage(BinaryStage)
            .stage(FragmentStage::new(profile.link.max_payload_length)?)
            .stage(CodecStage::new(profile.codecs.clone(), profile.error_if_no_match)?)
            .stage(TypeCacheStage::new(cache.clone()))
            .stage(MessageIdGuardStage::new(cache.clone(), profile.allowed.iter().cloned()))
            .finalize()?;

        let (ctx, outbound) = ConnectionContext::new(identity, cache, shutdown);
        let deliverability = Arc::new(DeliverabilityManager::new(
            ctx.clone(),
            profile.link.deliverability_timeout(),
            profile.link.max_retries,
        ));
        let queries = Arc::new(QueryManager::new(ctx.clone()));
        let reporters: Vec<Box<dyn MetadataReporter>> = vec![
            Box::new(StaticReporter::new(options.static_metadata())),
            Box::new(HeartbeatReporter::new(profile.link.heartbeat.clone())),
        ];

        debug!(
            identity = %ctx.identity(),
            transport = options.transport_key(),
            stages = ?pipeline,
            "Connection assembled."
        );

        Ok(Connection::new(
            ctx,
            options.into_transport(),
            pipeline,
            outbound,
            deliverability,
            queries,
            reporters,
            profile.handshake_timeout,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::error::Error;
    use crate::transport::LoopbackHub;

    fn options() -> TransportOptions {
        TransportOptions::Loopback {
            endpoint: "bench".into(),
            hub: LoopbackHub::new(),
        }
    }

    #[test]
    fn test_build_uses_fixed_stage_order() {
        let config = Config::default();
        let factory = TransportFactory::new(TransportProfile::from_config(&config, &config.serial.link));

        let connection = factory
            .build(ConnectionId::from("loopback:endpoint=bench"), options(), CancellationToken::new())
            .unwrap();

        assert_eq!(
            connection.stage_names(),
            ["framing", "binary", "fragments", "codec", "type_cache", "message_id_guard"]
        );
        assert_eq!(connection.reporter_names(), ["static", "heartbeat"]);
        assert_eq!(connection.context().state(), ConnectionState::Configuring);
    }

    #[test]
    fn test_no_codecs_fails_fast() {
        let config = Config::default();
        let mut profile = TransportProfile::from_config(&config, &config.serial.link);
        profile.codecs = CodecRegistry::new();

        let result = TransportFactory::new(profile).build(
            ConnectionId::from("loopback:endpoint=bench"),
            options(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::Construction(_))));
    }

    #[test]
    fn test_static_types_seed_cache() {
        let mut config = Config::default();
        config
            .protocol
            .type_cache
            .insert("fan_rpm".into(), TypeTag::Uint16);
        let factory = TransportFactory::new(TransportProfile::from_config(&config, &config.tcp.link));

        let connection = factory
            .build(ConnectionId::from("loopback:endpoint=bench"), options(), CancellationToken::new())
            .unwrap();

        assert_eq!(
            connection.context().type_cache().type_of(&MessageId::from("fan_rpm")),
            Some(TypeTag::Uint16)
        );
    }
}
