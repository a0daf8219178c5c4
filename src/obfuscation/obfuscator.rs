//! Frame wrapping against a profile template
//!
//! Given a shaped payload and a target profile, produces a ready-to-send
//! wire frame: profile id stamped, extra-header length drawn from the
//! profile's range, filler bytes per the profile's policy, padding bytes
//! appended up to the shaper's target. The extra-header length and all
//! filler are derived deterministically from `(seq, path_id)` and the run
//! seed, so a replay with the same seed produces identical bytes.

use super::{FillerPolicy, ObfuscationError, ProfileCatalog};
use crate::tunnel::{flags, Frame, MAX_PAYLOAD_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Everything needed to wrap one outgoing payload.
#[derive(Debug, Clone)]
pub struct FrameSpec {
    /// Application bytes for this fragment
    pub payload: Bytes,
    /// Target payload-region length after padding, >= `payload.len()`
    pub pad_to: usize,
    /// Extra flag bits (PAD, ACK, HANDSHAKE); FRAG is derived
    pub flags: u8,
    pub seq: u32,
    pub frag_id: u16,
    pub frag_total: u16,
    pub group_id: u32,
    pub path_id: u8,
    pub proto_id: u8,
    /// Per-path variant from the active strategy snapshot; perturbs the
    /// deterministic extra-header draw
    pub variant: u8,
}

/// Stateless frame wrapper; all variation comes from the seed and the
/// per-frame `(seq, path_id)` pair.
///
/// `level` is the `OBFUSCATION_LEVEL` knob: 0 disables extra headers and
/// preludes entirely, 1 enables extra headers, 2 adds preludes, 3
/// additionally allows profile rotation (enforced by the strategy engine).
pub struct Obfuscator {
    catalog: ProfileCatalog,
    seed: u64,
    level: u8,
}

impl Obfuscator {
    pub fn new(seed: u64, level: u8) -> Self {
        Self {
            catalog: ProfileCatalog,
            seed,
            level,
        }
    }

    pub fn catalog(&self) -> &ProfileCatalog {
        &self.catalog
    }

    /// Wrap a shaped payload into a wire frame.
    pub fn wrap(&self, spec: FrameSpec) -> Result<Frame, ObfuscationError> {
        let template = self.catalog.get(spec.proto_id)?;
        let mut rng = self.frame_rng(spec.seq, spec.path_id, spec.variant);

        let extra_header = if self.level == 0 {
            Bytes::new()
        } else {
            let (lo, hi) = template.extra_len_range;
            let extra_len = rng.gen_range(lo..=hi) as usize;
            fill_extra(template.filler, extra_len, &mut rng)
        };

        let real_len = spec.payload.len();
        let pad_to = spec.pad_to.max(real_len).min(MAX_PAYLOAD_SIZE);
        let mut payload = BytesMut::with_capacity(pad_to);
        payload.put_slice(&spec.payload);
        if pad_to > real_len {
            let mut pad = vec![0u8; pad_to - real_len];
            rng.fill_bytes(&mut pad);
            payload.put_slice(&pad);
        }

        let frag_flag = if spec.frag_total > 1 { flags::FRAG } else { 0 };
        Ok(Frame {
            proto_id: spec.proto_id,
            flags: spec.flags | frag_flag,
            seq: spec.seq,
            frag_id: spec.frag_id,
            frag_total: spec.frag_total,
            group_id: spec.group_id,
            real_len: real_len as u16,
            extra_header,
            payload: payload.freeze(),
        })
    }

    /// The handshake decoy frame for a profile, or `None` when the profile
    /// has no prelude or the level does not emit preludes. The caller is
    /// responsible for sending it exactly once per connection.
    pub fn prelude_frame(
        &self,
        proto_id: u8,
        path_id: u8,
    ) -> Result<Option<Frame>, ObfuscationError> {
        let template = self.catalog.get(proto_id)?;
        if self.level < 2 || template.prelude.is_empty() {
            return Ok(None);
        }
        let mut frame = Frame::handshake(0, Bytes::from_static(template.prelude));
        frame.proto_id = proto_id;
        let mut rng = self.frame_rng(0, path_id, 0);
        let (lo, hi) = template.extra_len_range;
        let extra_len = rng.gen_range(lo..=hi) as usize;
        frame.extra_header = fill_extra(template.filler, extra_len, &mut rng);
        Ok(Some(frame))
    }

    /// Per-frame RNG, stable for a given `(seed, seq, path_id, variant)`.
    fn frame_rng(&self, seq: u32, path_id: u8, variant: u8) -> StdRng {
        let stream = (seq as u64)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .rotate_left(17)
            ^ ((path_id as u64) << 56)
            ^ ((variant as u64) << 48);
        StdRng::seed_from_u64(self.seed ^ stream)
    }
}

fn fill_extra(policy: FillerPolicy, len: usize, rng: &mut StdRng) -> Bytes {
    let mut extra = vec![0u8; len];
    match policy {
        FillerPolicy::Random => rng.fill_bytes(&mut extra),
        FillerPolicy::FixedPattern(byte) => extra.fill(byte),
        FillerPolicy::Ascii => {
            for slot in extra.iter_mut() {
                // Printable range 0x20..=0x7E
                *slot = rng.gen_range(0x20..=0x7Eu8);
            }
        }
    }
    Bytes::from(extra)
}

#[cfg(test)]
mod tests {
    use super::super::PROFILE_COUNT;
    use super::*;

    fn spec(seq: u32, path_id: u8, proto_id: u8) -> FrameSpec {
        FrameSpec {
            payload: Bytes::from_static(b"payload"),
            pad_to: 32,
            flags: 0,
            seq,
            frag_id: 0,
            frag_total: 1,
            group_id: 1,
            path_id,
            proto_id,
            variant: 0,
        }
    }

    #[test]
    fn extra_len_within_profile_range() {
        let obfuscator = Obfuscator::new(42, 3);
        for proto_id in 0..PROFILE_COUNT {
            let template = *obfuscator.catalog().get(proto_id).unwrap();
            for seq in 0..200 {
                let frame = obfuscator.wrap(spec(seq, 0, proto_id)).unwrap();
                let len = frame.extra_header.len() as u8;
                assert!(len >= template.extra_len_range.0 && len <= template.extra_len_range.1);
            }
        }
    }

    #[test]
    fn wrapping_is_deterministic_per_seed() {
        let a = Obfuscator::new(7, 3);
        let b = Obfuscator::new(7, 3);
        for seq in 0..50 {
            let fa = a.wrap(spec(seq, 1, 1)).unwrap();
            let fb = b.wrap(spec(seq, 1, 1)).unwrap();
            assert_eq!(fa, fb);
        }
        let c = Obfuscator::new(8, 3);
        let differs = (0..50).any(|seq| {
            a.wrap(spec(seq, 1, 0)).unwrap().extra_header
                != c.wrap(spec(seq, 1, 0)).unwrap().extra_header
        });
        assert!(differs);
    }

    #[test]
    fn padding_applied_to_target() {
        let obfuscator = Obfuscator::new(1, 3);
        let frame = obfuscator.wrap(spec(0, 0, 0)).unwrap();
        assert_eq!(frame.payload.len(), 32);
        assert_eq!(frame.real_len, 7);
        assert_eq!(frame.real_payload(), b"payload");
    }

    #[test]
    fn level_zero_disables_extras() {
        let obfuscator = Obfuscator::new(1, 0);
        let frame = obfuscator.wrap(spec(0, 0, 1)).unwrap();
        assert!(frame.extra_header.is_empty());
        assert!(obfuscator.prelude_frame(1, 0).unwrap().is_none());
    }

    #[test]
    fn prelude_matches_template() {
        let obfuscator = Obfuscator::new(1, 2);
        // Profile 0 has no prelude
        assert!(obfuscator.prelude_frame(0, 0).unwrap().is_none());
        let frame = obfuscator.prelude_frame(2, 0).unwrap().unwrap();
        assert!(frame.flags & flags::HANDSHAKE != 0);
        let template = obfuscator.catalog().get(2).unwrap();
        assert_eq!(frame.real_payload(), template.prelude);
    }

    #[test]
    fn unknown_profile_fails() {
        let obfuscator = Obfuscator::new(1, 3);
        assert!(matches!(
            obfuscator.wrap(spec(0, 0, PROFILE_COUNT)),
            Err(ObfuscationError::UnknownProfile(_))
        ));
    }

    #[test]
    fn ascii_filler_is_printable() {
        let obfuscator = Obfuscator::new(3, 3);
        for seq in 0..100 {
            let frame = obfuscator.wrap(spec(seq, 2, 2)).unwrap();
            assert!(frame
                .extra_header
                .iter()
                .all(|&b| (0x20..=0x7E).contains(&b)));
        }
    }
}
