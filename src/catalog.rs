use thiserror::Error;

/// Product revision the built-in offsets were derived from.
pub const WECHAT_REVISION: &str = "3.2.1.156";

const JZ_SHORT: u8 = 0x74;
const JNZ_SHORT: u8 = 0x75;
const JMP_SHORT: u8 = 0xEB;
const NOP: u8 = 0x90;

/// `jz rel32` at the first gate in the 3.2.1.156 build.
const JZ_NEAR: [u8; 6] = [0x0F, 0x84, 0x46, 0x04, 0x00, 0x00];
/// `nop; jmp rel32`: ends where the `jz` ended, so the displacement is unchanged.
const JMP_NEAR_PADDED: [u8; 6] = [NOP, 0xE9, 0x46, 0x04, 0x00, 0x00];

/// `call [ExitProcess]` as found in the 3.2.1.156 build.
const EXIT_CALL: [u8; 6] = [0xFF, 0x15, 0x14, 0xE4, 0x5B, 0x11];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("site `{label}` has no transforms")]
    NoTransforms { label: String },
    #[error("site `{label}` transform {index} is empty")]
    EmptyPattern { label: String, index: usize },
    #[error("site `{label}` transform {index} changes length ({before} -> {after} bytes)")]
    LengthMismatch {
        label: String,
        index: usize,
        before: usize,
        after: usize,
    },
    #[error("site `{label}` overruns the 64-bit offset space")]
    OffsetOverflow { label: String },
    #[error("sites `{first}` and `{second}` overlap")]
    Overlap { first: String, second: String },
}

/// A single recognised encoding at a site and its same-length replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

impl Transform {
    pub fn new(before: impl Into<Vec<u8>>, after: impl Into<Vec<u8>>) -> Self {
        Self {
            before: before.into(),
            after: after.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.before.len()
    }
}

/// A fixed file offset plus every encoding we are willing to rewrite there.
///
/// Transforms are tried in declared order. Each one is length-preserving, so
/// applying a site never shifts any other byte in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSite {
    offset: u64,
    label: String,
    transforms: Vec<Transform>,
}

impl PatchSite {
    pub fn new(
        offset: u64,
        label: impl Into<String>,
        transforms: Vec<Transform>,
    ) -> Result<Self, CatalogError> {
        let label = label.into();

        if transforms.is_empty() {
            return Err(CatalogError::NoTransforms { label });
        }

        for (index, t) in transforms.iter().enumerate() {
            if t.before.is_empty() {
                return Err(CatalogError::EmptyPattern { label, index });
            }
            if t.before.len() != t.after.len() {
                return Err(CatalogError::LengthMismatch {
                    label,
                    index,
                    before: t.before.len(),
                    after: t.after.len(),
                });
            }
        }

        let site = Self {
            offset,
            label,
            transforms,
        };
        if site.offset.checked_add(site.width()).is_none() {
            return Err(CatalogError::OffsetOverflow { label: site.label });
        }

        Ok(site)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    /// Index of the transform whose replacement is already at the start of `observed`.
    pub fn patched_by(&self, observed: &[u8]) -> Option<usize> {
        self.transforms
            .iter()
            .position(|t| observed.get(..t.after.len()) == Some(t.after.as_slice()))
    }

    /// Number of bytes the widest transform touches.
    pub fn width(&self) -> u64 {
        self.transforms.iter().map(Transform::len).max().unwrap_or(0) as u64
    }

    fn end(&self) -> u64 {
        self.offset + self.width()
    }
}

/// The immutable set of sites for one product revision.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub product: String,
    /// Version tag the offsets belong to. Other revisions need re-derived offsets.
    pub revision: String,
    pub file_name: String,
    pub image_name: String,
    sites: Vec<PatchSite>,
}

impl Catalog {
    pub fn new(
        product: impl Into<String>,
        revision: impl Into<String>,
        file_name: impl Into<String>,
        image_name: impl Into<String>,
        sites: Vec<PatchSite>,
    ) -> Result<Self, CatalogError> {
        let mut by_offset: Vec<&PatchSite> = sites.iter().collect();
        by_offset.sort_by_key(|s| s.offset);
        for pair in by_offset.windows(2) {
            if pair[0].end() > pair[1].offset {
                return Err(CatalogError::Overlap {
                    first: pair[0].label.clone(),
                    second: pair[1].label.clone(),
                });
            }
        }

        Ok(Self {
            product: product.into(),
            revision: revision.into(),
            file_name: file_name.into(),
            image_name: image_name.into(),
            sites,
        })
    }

    /// Sites for `WeChatWin.dll` 3.2.1.156.
    ///
    /// The two mutex gates are conditional jumps around the "already running"
    /// exit branch; either short condition encoding becomes a short `jmp`, and
    /// the near `jz` at the first gate becomes `nop; jmp rel32`. The exit call is
    /// six bytes of `call [ExitProcess]`, replaced with NOPs.
    pub fn builtin() -> Result<Self, CatalogError> {
        let mutex_gate = || {
            vec![
                Transform::new([JZ_SHORT], [JMP_SHORT]),
                Transform::new([JNZ_SHORT], [JMP_SHORT]),
            ]
        };

        let sites = vec![
            // VA 0x103EFF7E
            PatchSite::new(0x003E_F37E, "mutex_jump #1", {
                let mut gate = mutex_gate();
                gate.push(Transform::new(JZ_NEAR, JMP_NEAR_PADDED));
                gate
            })?,
            // VA 0x10A1089E
            PatchSite::new(0x00A0_FC9E, "mutex_jump #2", mutex_gate())?,
            // VA 0x10A16578
            PatchSite::new(
                0x00A1_5978,
                "exit_call",
                vec![Transform::new(EXIT_CALL, [NOP; 6])],
            )?,
        ];

        Self::new(
            "WeChat",
            WECHAT_REVISION,
            "WeChatWin.dll",
            "WeChat.exe",
            sites,
        )
    }

    pub fn sites(&self) -> &[PatchSite] {
        &self.sites
    }

    pub fn matches_revision(&self, version: Option<&str>) -> bool {
        version.map(str::trim) == Some(self.revision.as_str())
    }
}
