//! Endpoint identifiers.
//!
//! An EID is `scheme:nss`. The `ipn` scheme (and the `imc` multicast
//! scheme) use numeric `node.service` pairs that can travel in compact
//! CBHE form; everything else travels as offsets into a per-bundle
//! dictionary of NUL-terminated strings.

use std::fmt;

pub const CBHE_SCHEME: &str = "ipn";
pub const MULTICAST_SCHEME: &str = "imc";
pub const NULL_EID: &str = "dtn:none";

pub const MAX_SCHEME_NAME_LEN: usize = 15;
pub const MAX_NSS_LEN: usize = 63;
pub const MAX_EID_LEN: usize = MAX_SCHEME_NAME_LEN + MAX_NSS_LEN + 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EidError {
    #[error("empty endpoint id")]
    Empty,
    #[error("endpoint id {0:?} has no scheme separator")]
    NoScheme(String),
    #[error("scheme name too long in {0:?}")]
    SchemeTooLong(String),
    #[error("scheme-specific part too long in {0:?}")]
    NssTooLong(String),
    #[error("malformed node.service pair in {0:?}")]
    BadNumericEid(String),
    #[error("dictionary offset {0} out of range")]
    BadOffset(u64),
    #[error("dictionary string at offset {0} is not terminated")]
    Unterminated(u64),
}

// ── CBHE ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CbheEid {
    pub node: u64,
    pub service: u64,
}

impl CbheEid {
    pub const NULL: CbheEid = CbheEid { node: 0, service: 0 };

    pub fn new(node: u64, service: u64) -> Self {
        Self { node, service }
    }

    pub fn is_null(&self) -> bool {
        self.node == 0 && self.service == 0
    }
}

impl fmt::Display for CbheEid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str(NULL_EID)
        } else {
            write!(f, "{CBHE_SCHEME}:{}.{}", self.node, self.service)
        }
    }
}

// ── Parsed EIDs ──────────────────────────────────────────────────────────────

/// A parsed endpoint id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaEid {
    pub scheme: String,
    pub nss: String,
    /// Node and service numbers for `ipn` and `imc` EIDs.
    pub numeric: Option<CbheEid>,
    pub null: bool,
}

impl MetaEid {
    pub fn parse(text: &str) -> Result<Self, EidError> {
        if text.is_empty() {
            return Err(EidError::Empty);
        }
        if text == NULL_EID {
            return Ok(Self {
                scheme: "dtn".into(),
                nss: "none".into(),
                numeric: None,
                null: true,
            });
        }
        let (scheme, nss) = text
            .split_once(':')
            .ok_or_else(|| EidError::NoScheme(text.to_string()))?;
        if scheme.is_empty() {
            return Err(EidError::NoScheme(text.to_string()));
        }
        if scheme.len() > MAX_SCHEME_NAME_LEN {
            return Err(EidError::SchemeTooLong(text.to_string()));
        }
        if nss.is_empty() || nss.len() > MAX_NSS_LEN {
            return Err(EidError::NssTooLong(text.to_string()));
        }

        let numeric = if scheme == CBHE_SCHEME || scheme == MULTICAST_SCHEME {
            let (node, service) = nss
                .split_once('.')
                .ok_or_else(|| EidError::BadNumericEid(text.to_string()))?;
            let node = node
                .parse()
                .map_err(|_| EidError::BadNumericEid(text.to_string()))?;
            let service = service
                .parse()
                .map_err(|_| EidError::BadNumericEid(text.to_string()))?;
            Some(CbheEid { node, service })
        } else {
            None
        };

        let null = matches!(numeric, Some(c) if scheme == CBHE_SCHEME && c.is_null());
        Ok(Self {
            scheme: scheme.to_string(),
            nss: nss.to_string(),
            numeric,
            null,
        })
    }

    /// True when this EID can be carried in CBHE form.
    pub fn is_cbhe(&self) -> bool {
        self.scheme == CBHE_SCHEME && self.numeric.is_some()
    }

    pub fn is_multicast(&self) -> bool {
        self.scheme == MULTICAST_SCHEME
    }

    /// Node number of an `ipn` EID.
    pub fn node(&self) -> Option<u64> {
        if self.scheme == CBHE_SCHEME {
            self.numeric.map(|c| c.node)
        } else {
            None
        }
    }

    /// The administrative EID of the node named by an `ipn` EID (`ipn:N.0`).
    pub fn node_eid(&self) -> Option<String> {
        self.node().map(|n| format!("{CBHE_SCHEME}:{n}.0"))
    }
}

impl std::str::FromStr for MetaEid {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetaEid::parse(s)
    }
}

impl fmt::Display for MetaEid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.null {
            f.write_str(NULL_EID)
        } else {
            write!(f, "{}:{}", self.scheme, self.nss)
        }
    }
}

// ── In-bundle references ─────────────────────────────────────────────────────

/// How an EID is carried inside a bundle's primary block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EidRef {
    Cbhe(CbheEid),
    /// Byte offsets of the scheme name and NSS within the dictionary.
    Dict { scheme: u64, nss: u64 },
}

impl EidRef {
    pub const NULL: EidRef = EidRef::Cbhe(CbheEid::NULL);

    /// The two SDNV values written to the primary block.
    pub fn values(&self) -> (u64, u64) {
        match *self {
            EidRef::Cbhe(c) => (c.node, c.service),
            EidRef::Dict { scheme, nss } => (scheme, nss),
        }
    }
}

/// NUL-terminated scheme and NSS strings, referenced by byte offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary(Vec<u8>);

impl Dictionary {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a dictionary holding every EID in `eids`, sharing duplicate
    /// strings. Returns one reference per input, in order.
    pub fn build(eids: &[&MetaEid]) -> (Dictionary, Vec<EidRef>) {
        let mut dict = Dictionary::default();
        let refs = eids
            .iter()
            .map(|eid| EidRef::Dict {
                scheme: dict.intern(&eid.scheme),
                nss: dict.intern(&eid.nss),
            })
            .collect();
        (dict, refs)
    }

    fn intern(&mut self, s: &str) -> u64 {
        let mut offset = 0;
        for entry in self.0.split(|b| *b == 0) {
            if offset >= self.0.len() {
                break;
            }
            if entry == s.as_bytes() {
                return offset as u64;
            }
            offset += entry.len() + 1;
        }
        let at = self.0.len();
        self.0.extend_from_slice(s.as_bytes());
        self.0.push(0);
        at as u64
    }

    pub fn string_at(&self, offset: u64) -> Result<&str, EidError> {
        let start = usize::try_from(offset).map_err(|_| EidError::BadOffset(offset))?;
        if start >= self.0.len() {
            return Err(EidError::BadOffset(offset));
        }
        let tail = &self.0[start..];
        let end = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or(EidError::Unterminated(offset))?;
        std::str::from_utf8(&tail[..end]).map_err(|_| EidError::Unterminated(offset))
    }

    /// Render a reference as an EID string.
    pub fn resolve(&self, eid: &EidRef) -> Result<String, EidError> {
        match eid {
            EidRef::Cbhe(c) => Ok(c.to_string()),
            EidRef::Dict { scheme, nss } => {
                let scheme = self.string_at(*scheme)?;
                let nss = self.string_at(*nss)?;
                Ok(format!("{scheme}:{nss}"))
            }
        }
    }
}
