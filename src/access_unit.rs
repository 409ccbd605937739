/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Contains the fundamental data structures for compressed access units.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One clear/cipher byte range of an encrypted access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsampleEntry {
    /// Number of unencrypted bytes at the start of the range.
    pub clear_bytes: u32,
    /// Number of encrypted bytes following the clear bytes.
    pub cipher_bytes: u32,
}

/// Decryption metadata carried by an encrypted access unit.
///
/// An access unit is encrypted if and only if it carries a `CryptoInfo`,
/// so key id and IV are always present together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoInfo {
    /// Identifies the decryption key within the attached DRM session.
    pub key_id: Vec<u8>,
    /// Initialization vector for this unit.
    pub iv: Vec<u8>,
    /// Clear/cipher layout of the payload. Empty means fully encrypted.
    pub subsamples: Vec<SubsampleEntry>,
}

/// One demuxed, still-compressed sample with its timestamp and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessUnit {
    /// The compressed payload. Empty for synthetic markers.
    pub payload: Vec<u8>,
    /// Presentation timestamp relative to the start of the stream.
    pub timestamp: Duration,
    /// No further input will arrive after this unit.
    pub is_end_of_stream: bool,
    /// The demuxer cancelled this unit (typically during a seek).
    pub is_aborted: bool,
    /// Signals a pending format transition. Mutually exclusive with payload.
    pub is_config_changed: bool,
    /// The unit can be decoded without reference to earlier units.
    pub is_key_frame: bool,
    /// Present only when the unit is encrypted.
    pub crypto: Option<CryptoInfo>,
}

impl AccessUnit {
    /// Creates a clear data unit.
    pub fn data(timestamp: Duration, payload: Vec<u8>) -> Self {
        Self {
            payload,
            timestamp,
            is_end_of_stream: false,
            is_aborted: false,
            is_config_changed: false,
            is_key_frame: false,
            crypto: None,
        }
    }

    /// Creates an encrypted data unit.
    pub fn encrypted_data(timestamp: Duration, payload: Vec<u8>, crypto: CryptoInfo) -> Self {
        Self {
            crypto: Some(crypto),
            ..Self::data(timestamp, payload)
        }
    }

    /// Creates the end-of-stream marker.
    pub fn end_of_stream() -> Self {
        Self {
            is_end_of_stream: true,
            ..Self::data(Duration::ZERO, Vec::new())
        }
    }

    /// Creates an aborted unit.
    pub fn aborted() -> Self {
        Self {
            is_aborted: true,
            ..Self::data(Duration::ZERO, Vec::new())
        }
    }

    /// Creates a config-change marker.
    pub fn config_change() -> Self {
        Self {
            is_config_changed: true,
            ..Self::data(Duration::ZERO, Vec::new())
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }
}

/// Format parameters describing how to configure a codec for a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Mime type of the stream, e.g. "video/vp9" or "audio/opus".
    pub mime_type: String,
    /// Codec-specific initialization data (e.g. SPS/PPS for H.264).
    pub codec_specific_data: Vec<u8>,
    /// The stream requires an attached DRM session to decode.
    pub is_encrypted: bool,
}

impl MediaConfig {
    pub fn new(mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            codec_specific_data: Vec::new(),
            is_encrypted: false,
        }
    }
}

/// An ordered batch of access units delivered by one demuxer pull.
///
/// When the chunk ends in a config-change marker, `config` carries the new
/// format parameters the following units will be encoded with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessUnitChunk {
    pub units: Vec<AccessUnit>,
    pub config: Option<MediaConfig>,
}

impl AccessUnitChunk {
    pub fn new(units: Vec<AccessUnit>) -> Self {
        Self {
            units,
            config: None,
        }
    }

    /// A chunk whose last unit announces the given config transition.
    pub fn with_config_change(mut units: Vec<AccessUnit>, config: MediaConfig) -> Self {
        units.push(AccessUnit::config_change());
        Self {
            units,
            config: Some(config),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_carry_no_payload() {
        assert!(AccessUnit::end_of_stream().payload.is_empty());
        assert!(AccessUnit::aborted().payload.is_empty());
        assert!(AccessUnit::config_change().payload.is_empty());
    }

    #[test]
    fn encryption_is_all_or_nothing() {
        let clear = AccessUnit::data(Duration::ZERO, vec![1, 2, 3]);
        assert!(!clear.is_encrypted());

        let unit = AccessUnit::encrypted_data(
            Duration::from_millis(33),
            vec![1, 2, 3],
            CryptoInfo {
                key_id: vec![0xaa],
                iv: vec![0xbb; 16],
                subsamples: vec![SubsampleEntry {
                    clear_bytes: 1,
                    cipher_bytes: 2,
                }],
            },
        );
        let crypto = unit.crypto.as_ref().unwrap();
        assert!(!crypto.key_id.is_empty());
        assert!(!crypto.iv.is_empty());
    }

    #[test]
    fn config_change_chunk_appends_marker() {
        let chunk = AccessUnitChunk::with_config_change(
            vec![AccessUnit::data(Duration::ZERO, vec![0; 4])],
            MediaConfig::new("video/vp9"),
        );
        assert_eq!(chunk.len(), 2);
        assert!(chunk.units.last().unwrap().is_config_changed);
        assert!(chunk.config.is_some());
    }
}
