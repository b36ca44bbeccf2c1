use std::collections::HashMap;
use std::sync::Arc;

use fanout_media::{CodecError, CodecFactory, Decoder, EncodedPayload, Encoder, MediaPacket};
use fanout_protocol::CodecParameters;

/// Encoder output for one target codec
pub struct TargetOutput {
    pub target: CodecParameters,
    pub result: Result<Vec<EncodedPayload>, CodecError>,
}

/// Decoders and encoders of one router.
///
/// Each source packet is decoded once; the decoded frame is encoded once per
/// distinct target codec, however many subscribers share that target.
pub struct TranscodeEngine {
    factory: Arc<dyn CodecFactory>,
    decoders: HashMap<u8, Box<dyn Decoder>>,
    encoders: HashMap<CodecParameters, Box<dyn Encoder>>,
    generation: u64,
}

impl TranscodeEngine {
    pub fn new(factory: Arc<dyn CodecFactory>) -> Self {
        Self {
            factory,
            decoders: HashMap::new(),
            encoders: HashMap::new(),
            generation: 0,
        }
    }

    /// Drop all codec state if it belongs to an older publisher
    pub fn prepare(&mut self, generation: u64) {
        if self.generation != generation {
            self.reset();
            self.generation = generation;
        }
    }

    pub fn reset(&mut self) {
        self.decoders.clear();
        self.encoders.clear();
    }

    pub fn force_keyframes(&mut self) {
        for encoder in self.encoders.values_mut() {
            encoder.force_keyframe();
        }
    }

    /// Decode `packet` and encode it for every target.
    ///
    /// `Err` means nothing could be produced for any target: the decoder is
    /// unavailable or this packet failed to decode. `Ok(None)` means the
    /// decoder needs more packets before it has a frame.
    pub fn transcode(
        &mut self,
        source: &CodecParameters,
        packet: &MediaPacket,
        targets: &[CodecParameters],
    ) -> Result<Option<Vec<TargetOutput>>, CodecError> {
        let decoder = match self.decoders.entry(source.payload_type) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => entry.insert(self.factory.decoder(source)?),
        };
        let Some(frame) = decoder.decode(packet)? else {
            return Ok(None);
        };

        let outputs = targets
            .iter()
            .map(|target| {
                let result = self.encoder(target).and_then(|encoder| encoder.encode(&frame));
                TargetOutput {
                    target: target.clone(),
                    result,
                }
            })
            .collect();
        Ok(Some(outputs))
    }

    fn encoder(&mut self, target: &CodecParameters) -> Result<&mut Box<dyn Encoder>, CodecError> {
        if !self.encoders.contains_key(target) {
            let encoder = self.factory.encoder(target)?;
            self.encoders.insert(target.clone(), encoder);
        }
        self.encoders
            .get_mut(target)
            .ok_or(CodecError::Unsupported(target.codec))
    }

    pub fn decoder_count(&self) -> usize {
        self.decoders.len()
    }

    pub fn encoder_count(&self) -> usize {
        self.encoders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_media::CodecRegistry;
    use fanout_protocol::{Codec, MediaKind};

    fn pcmu_packet(seq: u16) -> MediaPacket {
        MediaPacket::builder(MediaKind::Audio)
            .ssrc(5)
            .sequence_number(seq)
            .timestamp(seq as u32 * 160)
            .payload_type(0)
            .payload(vec![0xffu8; 160])
            .build()
    }

    #[test]
    fn decodes_once_and_encodes_per_target() {
        let mut engine = TranscodeEngine::new(Arc::new(CodecRegistry::new()));
        let source = CodecParameters::new(Codec::Pcmu, 0);
        let targets = vec![CodecParameters::new(Codec::Pcma, 8)];

        let outputs = engine.transcode(&source, &pcmu_packet(1), &targets).unwrap().unwrap();
        assert_eq!(outputs.len(), 1);
        let payloads = outputs[0].result.as_ref().unwrap();
        assert_eq!(payloads[0].payload.len(), 160);
        assert_eq!(engine.decoder_count(), 1);
        assert_eq!(engine.encoder_count(), 1);

        engine.transcode(&source, &pcmu_packet(2), &targets).unwrap();
        assert_eq!(engine.decoder_count(), 1);
        assert_eq!(engine.encoder_count(), 1);
    }

    #[test]
    fn unsupported_target_fails_only_that_target() {
        let mut engine = TranscodeEngine::new(Arc::new(CodecRegistry::new()));
        let source = CodecParameters::new(Codec::Pcmu, 0);
        let targets = vec![
            CodecParameters::new(Codec::Vp8, 96),
            CodecParameters::new(Codec::Pcma, 8),
        ];
        let outputs = engine.transcode(&source, &pcmu_packet(1), &targets).unwrap().unwrap();
        assert!(matches!(outputs[0].result, Err(CodecError::Unsupported(Codec::Vp8))));
        assert!(outputs[1].result.is_ok());
    }

    #[test]
    fn new_generation_resets_state() {
        let mut engine = TranscodeEngine::new(Arc::new(CodecRegistry::new()));
        let source = CodecParameters::new(Codec::Pcmu, 0);
        engine.prepare(1);
        engine
            .transcode(&source, &pcmu_packet(1), &[CodecParameters::new(Codec::Pcma, 8)])
            .unwrap();
        engine.prepare(1);
        assert_eq!(engine.decoder_count(), 1);
        engine.prepare(2);
        assert_eq!(engine.decoder_count(), 0);
        assert_eq!(engine.encoder_count(), 0);
    }
}
