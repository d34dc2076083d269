//! Update descriptors and their signatures
//!
//! A descriptor names an update — (uuid, version) — and carries the swarm
//! metadata needed to fetch its payload. The file format is bencode with
//! keys in lexicographic order, which doubles as the canonical form: the
//! signed bytes are the same encoding with the `signature` field omitted.
//! Signatures are RSA PKCS#1 v1.5 over SHA-256. A JSON rendering exists for
//! tooling; the protocol only ever carries bencode.

use crate::error::{Result, SwarmpatchError};
use crate::swarm::Metainfo;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use uuid::{uuid, Uuid};

/// Updates deployed by running a shell script.
/// `uuidgen --sha1 --namespace @oid --name /bin/sh`
pub const UUID_SHELL: Uuid = uuid!("f5adf0cb-b0e1-5a22-97f1-09092f566438");

/// Updates deployed through APK (Alpine package management).
/// `uuidgen --sha1 --namespace @oid --name /sbin/apk`
pub const UUID_APK: Uuid = uuid!("5ee3a38d-a8dc-514e-9c74-42ab160648aa");

/// One file of a multi-file payload; `path` components are relative to the
/// payload directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub length: i64,
    pub path: Vec<String>,
}

/// Standard swarm info dictionary.
///
/// Bencode dictionaries need lexicographically ordered keys and the encoder
/// emits fields in declaration order, so the declarations below are sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    /// Concatenated SHA-1 digests, one per piece
    pub pieces: ByteBuf,
}

impl TorrentInfo {
    pub fn total_length(&self) -> i64 {
        match (&self.files, self.length) {
            (Some(files), _) => files.iter().map(|f| f.length).sum(),
            (None, Some(length)) => length,
            (None, None) => 0,
        }
    }

    /// Relative paths of every payload file.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        match &self.files {
            Some(files) => files
                .iter()
                .map(|f| {
                    let mut path = PathBuf::from(&self.name);
                    for part in &f.path {
                        path.push(part);
                    }
                    path
                })
                .collect(),
            None => vec![PathBuf::from(&self.name)],
        }
    }
}

/// A signed update descriptor. Field declarations are in bencode key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDescriptor {
    pub info: TorrentInfo,
    pub piece_length: u32,
    #[serde(with = "serde_bytes", default)]
    pub signature: Vec<u8>,
    pub tracker: String,
    #[serde(with = "uuid_string")]
    pub uuid: Uuid,
    pub version: u32,
}

/// The descriptor minus its signature, borrowed for canonical encoding.
#[derive(Serialize)]
struct SignedForm<'a> {
    info: &'a TorrentInfo,
    piece_length: u32,
    tracker: &'a str,
    #[serde(with = "uuid_string")]
    uuid: Uuid,
    version: u32,
}

impl UpdateDescriptor {
    /// Uniqueness key; a higher version supersedes.
    pub fn key(&self) -> (Uuid, u32) {
        (self.uuid, self.version)
    }

    /// Canonical bytes covered by the signature.
    pub fn signed_form(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(&SignedForm {
            info: &self.info,
            piece_length: self.piece_length,
            tracker: &self.tracker,
            uuid: self.uuid,
            version: self.version,
        })?)
    }

    /// Sign the canonical form with the submitter's private key.
    pub fn sign(&mut self, key: &RsaPrivateKey) -> Result<()> {
        let form = self.signed_form()?;
        let signing_key = SigningKey::<Sha256>::new(key.clone());
        self.signature = signing_key.sign(&form).to_vec();
        Ok(())
    }

    /// Verify the signature against the trusted public key.
    pub fn verify(&self, key: &RsaPublicKey) -> Result<()> {
        if self.signature.is_empty() {
            return Err(SwarmpatchError::Verification);
        }
        let form = self.signed_form()?;
        let signature = Signature::try_from(self.signature.as_slice())
            .map_err(|_| SwarmpatchError::Verification)?;
        let verifying_key = VerifyingKey::<Sha256>::new(key.clone());
        verifying_key
            .verify(&form, &signature)
            .map_err(|_| SwarmpatchError::Verification)
    }

    /// Bencode wire/file form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(raw)?)
    }

    /// SHA-1 of the bencoded info dictionary.
    pub fn infohash(&self) -> Result<[u8; 20]> {
        let info = serde_bencode::to_bytes(&self.info)?;
        Ok(Sha1::digest(&info).into())
    }

    /// Metainfo handed to the swarm engine.
    pub fn metainfo(&self) -> Result<Metainfo> {
        Ok(Metainfo {
            info_hash: self.infohash()?,
            name: self.info.name.clone(),
            tracker: self.tracker.clone(),
            piece_length: self.info.piece_length,
            total_length: self.info.total_length(),
            files: self.info.file_paths(),
        })
    }
}

/// Build an unsigned descriptor from a payload file or directory.
///
/// Directory payloads become multi-file descriptors; files are hashed in
/// sorted path order, mirroring how the fetching side lays them out.
pub fn from_payload(
    payload: &Path,
    uuid: Uuid,
    version: u32,
    tracker: &str,
    piece_length: u32,
) -> Result<UpdateDescriptor> {
    if piece_length == 0 {
        return Err(SwarmpatchError::Configuration(
            "piece length must be positive".to_string(),
        ));
    }
    let name = payload
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            SwarmpatchError::Configuration(format!(
                "payload path {} has no usable file name",
                payload.display()
            ))
        })?
        .to_string();

    let meta = std::fs::metadata(payload)?;
    let info = if meta.is_dir() {
        let mut entries = Vec::new();
        collect_files(payload, payload, &mut entries)?;
        entries.sort_by(|a, b| a.1.cmp(&b.1));
        let absolute: Vec<PathBuf> = entries.iter().map(|(abs, _)| abs.clone()).collect();
        let files = entries
            .into_iter()
            .map(|(abs, rel)| {
                Ok(FileEntry {
                    length: std::fs::metadata(&abs)?.len() as i64,
                    path: rel,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        TorrentInfo {
            files: Some(files),
            length: None,
            name,
            piece_length,
            pieces: ByteBuf::from(hash_pieces(&absolute, piece_length)?),
        }
    } else {
        TorrentInfo {
            files: None,
            length: Some(meta.len() as i64),
            name,
            piece_length,
            pieces: ByteBuf::from(hash_pieces(
                std::slice::from_ref(&payload.to_path_buf()),
                piece_length,
            )?),
        }
    };

    Ok(UpdateDescriptor {
        info,
        piece_length,
        signature: Vec::new(),
        tracker: tracker.to_string(),
        uuid,
        version,
    })
}

fn collect_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(PathBuf, Vec<String>)>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| SwarmpatchError::Configuration(e.to_string()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push((path, rel));
        }
    }
    Ok(())
}

/// SHA-1 each `piece_length` chunk of the concatenated file contents.
fn hash_pieces(paths: &[PathBuf], piece_length: u32) -> Result<Vec<u8>> {
    let piece_length = piece_length as usize;
    let mut pieces = Vec::new();
    let mut hasher = Sha1::new();
    let mut filled = 0usize;

    for path in paths {
        let mut file = File::open(path)?;
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let mut chunk = &buf[..n];
            while !chunk.is_empty() {
                let take = (piece_length - filled).min(chunk.len());
                hasher.update(&chunk[..take]);
                filled += take;
                chunk = &chunk[take..];
                if filled == piece_length {
                    pieces.extend_from_slice(&hasher.finalize_reset());
                    filled = 0;
                }
            }
        }
    }
    if filled > 0 {
        pieces.extend_from_slice(&hasher.finalize_reset());
    }
    Ok(pieces)
}

/// Load an RSA private key from PKCS#1 or PKCS#8 PEM.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = std::fs::read_to_string(path)
        .map_err(|e| SwarmpatchError::KeyLoad(format!("cannot read {}: {e}", path.display())))?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
        .map_err(|e| SwarmpatchError::KeyLoad(format!("{}: {e}", path.display())))
}

/// Load an RSA public key from PKCS#1 or SPKI PEM.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey> {
    let pem = std::fs::read_to_string(path)
        .map_err(|e| SwarmpatchError::KeyLoad(format!("cannot read {}: {e}", path.display())))?;
    RsaPublicKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPublicKey::from_public_key_pem(&pem))
        .map_err(|e| SwarmpatchError::KeyLoad(format!("{}: {e}", path.display())))
}

mod uuid_string {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(uuid: &Uuid, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&uuid.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Uuid, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
