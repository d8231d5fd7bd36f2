//! secp256k1 keys, transaction sighashes, and input fulfillments.
//!
//! The script engine proper is the host's concern; what the contracts need is
//! the ability to sign a transaction's vins, to recognise whether a script-sig
//! satisfies a pay-to-pubkey or a crypto-condition output, and to recover the
//! signing pubkey from a condition fulfillment.

use crate::condition::Condition;
use crate::error::CcError;
use crate::types::{read_compact_size, sha256d, write_compact_size, PubKey, Transaction};
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use std::collections::HashMap;

const SIG_NORMAL_TAG: u8 = 0x01;
const SIG_CONDITION_TAG: u8 = 0xcc;

/// Signing key plus its cached compressed pubkey.
#[derive(Clone)]
pub struct Keypair {
    secret: SigningKey,
    pubkey: PubKey,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair").field("pubkey", &self.pubkey).finish()
    }
}

impl Keypair {
    pub fn from_secret(bytes: &[u8; 32]) -> Result<Self, CcError> {
        let secret = SigningKey::from_bytes(bytes.into())
            .map_err(|e| CcError::Signing(format!("invalid secret key: {e}")))?;
        let pubkey = compress(secret.verifying_key());
        Ok(Self { secret, pubkey })
    }

    pub fn pubkey(&self) -> PubKey {
        self.pubkey
    }

    pub fn sign(&self, digest: &[u8; 32]) -> [u8; 64] {
        // Signing over a 32-byte prehash cannot fail for a valid key.
        let sig: Signature = self.secret.sign_prehash(digest).expect("prehash sign");
        sig.to_bytes().into()
    }
}

fn compress(vk: &VerifyingKey) -> PubKey {
    let point = vk.to_encoded_point(true);
    PubKey::from_slice(point.as_bytes()).expect("compressed point is 33 bytes")
}

/// Derive the compressed pubkey for a published module secret.
pub fn pubkey_from_secret(bytes: &[u8; 32]) -> PubKey {
    Keypair::from_secret(bytes)
        .expect("module secrets are valid scalars")
        .pubkey()
}

pub fn verify(pk: &PubKey, digest: &[u8; 32], signature: &[u8; 64]) -> bool {
    let Ok(vk) = VerifyingKey::from_sec1_bytes(&pk.0) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    vk.verify_prehash(digest, &sig).is_ok()
}

/// Digest a transaction for signing input `vin_index`: the serialization with
/// every script-sig blanked, followed by the input index.
pub fn sighash(tx: &Transaction, vin_index: usize) -> [u8; 32] {
    let mut blanked = tx.clone();
    for vin in &mut blanked.inputs {
        vin.script_sig.clear();
    }
    let mut data = blanked.encode();
    data.extend_from_slice(&(vin_index as u32).to_le_bytes());
    sha256d(&data)
}

/// Script-sig for a pay-to-pubkey input.
pub fn normal_script_sig(pk: &PubKey, signature: &[u8; 64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(98);
    out.push(SIG_NORMAL_TAG);
    out.extend_from_slice(&pk.0);
    out.extend_from_slice(signature);
    out
}

pub fn decode_normal_script_sig(script_sig: &[u8]) -> Option<(PubKey, [u8; 64])> {
    if script_sig.len() != 98 || script_sig[0] != SIG_NORMAL_TAG {
        return None;
    }
    let pk = PubKey::from_slice(&script_sig[1..34])?;
    let sig: [u8; 64] = script_sig[34..98].try_into().ok()?;
    Some((pk, sig))
}

/// Fulfillment of a crypto-condition input: the condition being satisfied in
/// its plain (key-disclosing) form, the signer, and the signature. A spend of
/// an anonymised output matches when the plain condition's `to_anon` form
/// reproduces the output script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CcFulfillment {
    pub condition: Condition,
    pub signer: PubKey,
    pub signature: [u8; 64],
}

impl CcFulfillment {
    pub fn encode(&self) -> Vec<u8> {
        let cond = self.condition.encode();
        let mut out = Vec::with_capacity(cond.len() + 101);
        out.push(SIG_CONDITION_TAG);
        write_compact_size(&mut out, cond.len() as u64);
        out.extend_from_slice(&cond);
        out.extend_from_slice(&self.signer.0);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn decode(script_sig: &[u8]) -> Option<Self> {
        if script_sig.first() != Some(&SIG_CONDITION_TAG) {
            return None;
        }
        let mut pos = 1usize;
        let cond_len = read_compact_size(script_sig, &mut pos)? as usize;
        let cond_end = pos.checked_add(cond_len)?;
        let condition = Condition::decode(script_sig.get(pos..cond_end)?).ok()?;
        pos = cond_end;
        let signer = PubKey::from_slice(script_sig.get(pos..pos + 33)?)?;
        pos += 33;
        let signature: [u8; 64] = script_sig.get(pos..pos + 64)?.try_into().ok()?;
        pos += 64;
        if pos != script_sig.len() {
            return None;
        }
        Some(Self {
            condition,
            signer,
            signature,
        })
    }

    /// Whether this fulfillment's condition reproduces the spent output
    /// script, in either the plain or the anonymised form.
    pub fn matches_output(&self, output_script: &crate::script::Script) -> bool {
        self.condition.script() == *output_script
            || self.condition.to_anon().script() == *output_script
    }
}

/// True when the script-sig is a crypto-condition fulfillment.
pub fn is_cc_input(script_sig: &[u8]) -> bool {
    script_sig.first() == Some(&SIG_CONDITION_TAG)
}

/// The pubkey that signed a crypto-condition input, if decodable.
pub fn cc_signing_pubkey(script_sig: &[u8]) -> Option<PubKey> {
    CcFulfillment::decode(script_sig).map(|f| f.signer)
}

/// In-memory key material for transaction finalization.
#[derive(Default)]
pub struct KeyStore {
    keys: HashMap<PubKey, Keypair>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, keypair: Keypair) {
        self.keys.insert(keypair.pubkey(), keypair);
    }

    pub fn add_secret(&mut self, secret: &[u8; 32]) -> Result<PubKey, CcError> {
        let kp = Keypair::from_secret(secret)?;
        let pk = kp.pubkey();
        self.add(kp);
        Ok(pk)
    }

    pub fn get(&self, pk: &PubKey) -> Option<&Keypair> {
        self.keys.get(pk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Outpoint, TxId, TxIn};

    fn keypair(tag: u8) -> Keypair {
        let mut secret = [tag; 32];
        secret[0] = 1;
        Keypair::from_secret(&secret).unwrap()
    }

    #[test]
    fn sign_and_verify() {
        let kp = keypair(7);
        let digest = sha256d(b"payload");
        let sig = kp.sign(&digest);
        assert!(verify(&kp.pubkey(), &digest, &sig));
        let other = sha256d(b"other");
        assert!(!verify(&kp.pubkey(), &other, &sig));
    }

    #[test]
    fn sighash_ignores_existing_signatures() {
        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::new(Outpoint::new(TxId::zero(), 0)));
        let before = sighash(&tx, 0);
        tx.inputs[0].script_sig = vec![1, 2, 3];
        assert_eq!(before, sighash(&tx, 0));
    }

    #[test]
    fn fulfillment_roundtrip() {
        let kp = keypair(9);
        let cond = Condition::cc1of2(0xea, kp.pubkey(), keypair(5).pubkey());
        let fulfillment = CcFulfillment {
            condition: cond.clone(),
            signer: kp.pubkey(),
            signature: [0x5a; 64],
        };
        let encoded = fulfillment.encode();
        assert!(is_cc_input(&encoded));
        assert_eq!(CcFulfillment::decode(&encoded), Some(fulfillment));
        assert_eq!(cc_signing_pubkey(&encoded), Some(kp.pubkey()));
    }

    #[test]
    fn normal_script_sig_is_not_cc() {
        let kp = keypair(3);
        let sig = normal_script_sig(&kp.pubkey(), &[0u8; 64]);
        assert!(!is_cc_input(&sig));
        assert_eq!(decode_normal_script_sig(&sig).unwrap().0, kp.pubkey());
    }
}
