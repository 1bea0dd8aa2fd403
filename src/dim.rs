use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A 3-dimensional extent or coordinate.
///
/// Unused dimensions are carried as 1 (for sizes) or 0 (for coordinates and
/// offsets), so every launch is uniformly three-dimensional internally.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dim {
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse {value:?}: {source:?}")]
    Parse {
        value: String,
        source: Option<std::num::ParseIntError>,
    },
}

static DIM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\(?\s*(\d+)(?:\s*,\s*(\d+))?(?:\s*,\s*(\d+))?\s*\)?\s*$").unwrap()
});

impl TryFrom<&str> for Dim {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let captures = DIM_REGEX.captures(value).ok_or_else(|| Error::Parse {
            value: value.to_string(),
            source: None,
        })?;
        // missing components default to 1
        let get_dim = |i: usize| match captures.get(i) {
            Some(m) => m.as_str().parse().map_err(|err| Error::Parse {
                value: value.to_string(),
                source: Some(err),
            }),
            None => Ok(1),
        };

        Ok(Self {
            x: get_dim(1)?,
            y: get_dim(2)?,
            z: get_dim(3)?,
        })
    }
}

impl std::str::FromStr for Dim {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::try_from(value)
    }
}

impl Dim {
    pub const ZERO: Self = Self { x: 0, y: 0, z: 0 };
    pub const ONE: Self = Self { x: 1, y: 1, z: 1 };

    #[must_use]
    #[inline]
    pub fn new(x: u64, y: u64, z: u64) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    #[inline]
    pub fn size(&self) -> u64 {
        self.x * self.y * self.z
    }

    #[must_use]
    #[inline]
    pub fn into_tuple(self) -> (u64, u64, u64) {
        (self.x, self.y, self.z)
    }

    /// Row-major linear id of `self` within `bounds` (x fastest).
    #[must_use]
    #[inline]
    pub fn linear_id(&self, bounds: &Dim) -> u64 {
        self.x + bounds.x * self.y + bounds.x * bounds.y * self.z
    }
}

impl std::fmt::Display for Dim {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

impl From<u64> for Dim {
    #[inline]
    fn from(dim: u64) -> Self {
        Self { x: dim, y: 1, z: 1 }
    }
}

impl From<(u64, u64, u64)> for Dim {
    #[inline]
    fn from(dim: (u64, u64, u64)) -> Self {
        let (x, y, z) = dim;
        Self { x, y, z }
    }
}

impl std::ops::Index<usize> for Dim {
    type Output = u64;

    fn index(&self, index: usize) -> &u64 {
        match index {
            0 => &self.x,
            1 => &self.y,
            2 => &self.z,
            _ => panic!("dimension index {index} out of range"),
        }
    }
}

impl std::ops::IndexMut<usize> for Dim {
    fn index_mut(&mut self, index: usize) -> &mut u64 {
        match index {
            0 => &mut self.x,
            1 => &mut self.y,
            2 => &mut self.z,
            _ => panic!("dimension index {index} out of range"),
        }
    }
}

impl std::ops::Div for Dim {
    type Output = Self;

    fn div(self, rhs: Self) -> Self {
        Self::new(self.x / rhs.x, self.y / rhs.y, self.z / rhs.z)
    }
}

impl std::ops::Rem for Dim {
    type Output = Self;

    fn rem(self, rhs: Self) -> Self {
        Self::new(self.x % rhs.x, self.y % rhs.y, self.z % rhs.z)
    }
}

/// Iterates over 3-dimensional coordinates, x innermost.
#[derive(Debug, Clone)]
pub struct Iter {
    bounds: Dim,
    current: u64,
}

impl Iterator for Iter {
    type Item = Dim;

    fn next(&mut self) -> Option<Self::Item> {
        let Self { current, bounds } = self;
        if *current >= bounds.size() {
            return None;
        }
        let x = *current % bounds.x;
        let y = (*current / bounds.x) % bounds.y;
        let z = *current / (bounds.x * bounds.y);
        self.current += 1;
        Some(Dim { x, y, z })
    }
}

impl IntoIterator for Dim {
    type Item = Dim;
    type IntoIter = Iter;

    fn into_iter(self) -> Self::IntoIter {
        Iter {
            bounds: self,
            current: 0,
        }
    }
}

/// Normalized kernel launch geometry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NDRange {
    pub work_dim: u32,
    pub global_size: Dim,
    pub global_offset: Dim,
    pub local_size: Dim,
}

impl NDRange {
    /// Build a launch description, forcing dimensions beyond `work_dim` to
    /// size 1 and offset 0. A zero local size in a used dimension also falls
    /// back to 1.
    #[must_use]
    pub fn new(work_dim: u32, global_size: Dim, global_offset: Dim, local_size: Dim) -> Self {
        let mut range = Self {
            work_dim,
            global_size: Dim::ONE,
            global_offset: Dim::ZERO,
            local_size: Dim::ONE,
        };
        for i in 0..work_dim.min(3) as usize {
            range.global_size[i] = global_size[i];
            if global_offset[i] != 0 {
                range.global_offset[i] = global_offset[i];
            }
            if local_size[i] != 0 {
                range.local_size[i] = local_size[i];
            }
        }
        range
    }

    #[must_use]
    pub fn num_groups(&self) -> Dim {
        self.global_size / self.local_size
    }
}

impl Default for NDRange {
    fn default() -> Self {
        Self::new(1, Dim::ONE, Dim::ZERO, Dim::ONE)
    }
}
