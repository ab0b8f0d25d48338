use crate::error::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Shape of the attention score mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskKind {
    /// Fully dense score matrix.
    None,
    /// Causal triangle anchored at the first query and first key.
    CausalTopLeft,
    /// Causal triangle anchored at the last query and last key.
    CausalBottomRight,
    /// Sliding window with explicit left/right extents.
    Window,
}

impl fmt::Display for MaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaskKind::None => write!(f, "no_mask"),
            MaskKind::CausalTopLeft => write!(f, "causal_top_left"),
            MaskKind::CausalBottomRight => write!(f, "causal_bottom_right"),
            MaskKind::Window => write!(f, "window"),
        }
    }
}

/// Mask description passed by callers.
///
/// `left` and `right` are window extents in keys; `-1` means unbounded on that
/// side. They only matter for [`MaskKind::Window`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaskInfo {
    pub kind: MaskKind,
    pub left: i32,
    pub right: i32,
}

impl MaskInfo {
    pub const fn none() -> Self {
        Self {
            kind: MaskKind::None,
            left: -1,
            right: -1,
        }
    }

    /// Bottom-right aligned causal mask.
    pub const fn causal() -> Self {
        Self {
            kind: MaskKind::CausalBottomRight,
            left: -1,
            right: 0,
        }
    }

    pub const fn causal_top_left() -> Self {
        Self {
            kind: MaskKind::CausalTopLeft,
            left: -1,
            right: 0,
        }
    }

    pub fn window(left: i32, right: i32) -> Result<Self> {
        if left < -1 || right < -1 {
            return Err(DispatchError::InvalidArgument(format!(
                "window extents must be >= -1, got ({}, {})",
                left, right
            )));
        }
        Ok(Self {
            kind: MaskKind::Window,
            left,
            right,
        })
    }

    /// Whether key `j` is visible from query `i`.
    ///
    /// Windows are aligned to the bottom-right corner of the score matrix.
    #[inline]
    pub fn is_visible(&self, i: usize, j: usize, seqlen_q: usize, seqlen_k: usize) -> bool {
        let row = i as i64 + seqlen_k as i64 - seqlen_q as i64;
        let j = j as i64;
        match self.kind {
            MaskKind::None => true,
            MaskKind::CausalTopLeft => j <= i as i64,
            MaskKind::CausalBottomRight => j <= row,
            MaskKind::Window => {
                let lo_ok = self.left < 0 || j >= row - self.left as i64;
                let hi_ok = self.right < 0 || j <= row + self.right as i64;
                lo_ok && hi_ok
            }
        }
    }
}

impl Default for MaskInfo {
    fn default() -> Self {
        Self::none()
    }
}

impl FromStr for MaskInfo {
    type Err = DispatchError;

    /// Accepts `0`, `1`/`t` (top-left causal), `2`/`b`/`causal` (bottom-right
    /// causal), and `w:L,R` / `g:L,R`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "0" | "" | "none" => return Ok(Self::none()),
            "1" | "t" => return Ok(Self::causal_top_left()),
            "2" | "b" | "causal" => return Ok(Self::causal()),
            _ => {}
        }
        let extents = s
            .strip_prefix("w:")
            .or_else(|| s.strip_prefix("g:"))
            .ok_or_else(|| DispatchError::InvalidArgument(format!("invalid mask '{}'", s)))?;
        let (l, r) = extents
            .split_once(',')
            .ok_or_else(|| DispatchError::InvalidArgument(format!("invalid window '{}'", s)))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<i32>()
                .map_err(|e| {
                    DispatchError::InvalidArgument(format!("invalid window '{}': {}", s, e))
                })
        };
        Self::window(parse(l)?, parse(r)?)
    }
}
