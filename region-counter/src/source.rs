use crate::codec::Codec;
use crate::config::PipelineSettings;
use crate::error::{DecodeError, PipelineError};
use crate::metrics_consts::DECODE_ERRORS;
use crate::partition::PartitionedPipeline;
use crate::pipeline::ProfileRecord;
use crate::profile::UserProfile;
use crate::record::ChangeRecord;

/// What became of one source message.
#[derive(Debug)]
pub enum Forwarded {
    Dispatched,
    /// Undecodable; no state was touched.
    Skipped(DecodeError),
}

/// Turns raw source messages into profile change records. A message without a
/// payload is a deletion of its key.
pub struct SourceDecoder {
    keys: Box<dyn Codec<String>>,
    profiles: Box<dyn Codec<UserProfile>>,
}

impl SourceDecoder {
    pub fn new(keys: Box<dyn Codec<String>>, profiles: Box<dyn Codec<UserProfile>>) -> Self {
        Self { keys, profiles }
    }

    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self::new(
            settings.key_format.codec(),
            settings.profile_format.codec::<UserProfile>(),
        )
    }

    pub fn decode(
        &self,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<ProfileRecord, DecodeError> {
        let key = key.ok_or(DecodeError::MissingKey)?;
        let key = self.keys.decode(key).map_err(DecodeError::Key)?;

        match payload {
            None => Ok(ChangeRecord::tombstone(key)),
            Some(bytes) => {
                let profile = self.profiles.decode(bytes).map_err(DecodeError::Value)?;
                Ok(ChangeRecord::upsert(key, profile))
            }
        }
    }

    /// Decode one source message and hand it to `pipeline`. Only a stopped
    /// pipeline is an error; an undecodable message is skipped.
    pub async fn forward(
        &self,
        pipeline: &PartitionedPipeline,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<Forwarded, PipelineError> {
        match self.decode(key, payload) {
            Ok(record) => {
                pipeline.dispatch(record).await?;
                Ok(Forwarded::Dispatched)
            }
            Err(e) => {
                metrics::counter!(DECODE_ERRORS).increment(1);
                Ok(Forwarded::Skipped(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemorySink;
    use std::sync::Arc;

    fn complete_profile(region: &str) -> Vec<u8> {
        format!(r#"{{"experience": "{}", "region": "{region}"}}"#, "x".repeat(250)).into_bytes()
    }

    fn decoder() -> SourceDecoder {
        SourceDecoder::from_settings(&PipelineSettings::default())
    }

    #[test]
    fn test_decodes_profile() {
        let record = decoder()
            .decode(
                Some(b"user-1".as_slice()),
                Some(br#"{"experience": "lots", "region": "EU", "name": "Ada"}"#.as_slice()),
            )
            .unwrap();

        assert_eq!(record.key, "user-1");
        let profile = record.value.unwrap();
        assert_eq!(profile.region_key().unwrap(), "EU");
        assert!(profile.other.contains_key("name"));
    }

    #[test]
    fn test_missing_payload_is_a_tombstone() {
        let record = decoder().decode(Some(b"user-1".as_slice()), None).unwrap();
        assert_eq!(record, ChangeRecord::tombstone("user-1".to_string()));
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let err = decoder().decode(None, Some(b"{}".as_slice())).unwrap_err();
        assert!(matches!(err, DecodeError::MissingKey));
    }

    #[test]
    fn test_bad_key_is_rejected() {
        let err = decoder().decode(Some([0xc3u8, 0x28].as_slice()), None).unwrap_err();
        assert!(matches!(err, DecodeError::Key(_)));
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let err = decoder()
            .decode(Some(b"user-1".as_slice()), Some(b"{not json".as_slice()))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Value(_)));
    }

    #[tokio::test]
    async fn test_undecodable_message_is_skipped_without_touching_state() {
        let settings = PipelineSettings {
            count_threshold: 0,
            ..PipelineSettings::default()
        };
        let sink = Arc::new(MemorySink::default());
        let pipeline = PartitionedPipeline::start(&settings, sink.clone()).unwrap();
        let decoder = SourceDecoder::from_settings(&settings);

        let first = decoder
            .forward(&pipeline, Some(b"k1".as_slice()), Some(complete_profile("EU").as_slice()))
            .await
            .unwrap();
        assert!(matches!(first, Forwarded::Dispatched));

        // a corrupt update of k1 must not delete it, and a keyless one goes nowhere
        let corrupt = decoder
            .forward(&pipeline, Some(b"k1".as_slice()), Some(b"{not json".as_slice()))
            .await
            .unwrap();
        assert!(matches!(corrupt, Forwarded::Skipped(DecodeError::Value(_))));
        let keyless = decoder
            .forward(&pipeline, None, Some(complete_profile("EU").as_slice()))
            .await
            .unwrap();
        assert!(matches!(keyless, Forwarded::Skipped(DecodeError::MissingKey)));

        decoder
            .forward(&pipeline, Some(b"k2".as_slice()), Some(complete_profile("EU").as_slice()))
            .await
            .unwrap();
        pipeline.shutdown().await.unwrap();

        assert_eq!(
            sink.records(),
            vec![
                ChangeRecord::upsert("EU".to_string(), 1),
                ChangeRecord::upsert("EU".to_string(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_forward_reports_a_stopped_pipeline() {
        let settings = PipelineSettings::default();
        let pipeline =
            PartitionedPipeline::start(&settings, Arc::new(MemorySink::default())).unwrap();
        pipeline.cancel();

        let result = SourceDecoder::from_settings(&settings)
            .forward(&pipeline, Some(b"k1".as_slice()), None)
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
