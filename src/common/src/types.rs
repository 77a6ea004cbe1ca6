// Copyright 2025 Tidewave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Scalar values, key cells and their order-preserving codec.
//!
//! Key cells travel on the wire as opaque `memcomparable` buffers. Decoding
//! requires the column types, which every consumer of a key range already
//! knows from the table metadata.

use std::cmp::Ordering;
use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeId {
    Bool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Float64,
    Utf8,
    TimestampUs,
    Decimal,
}

impl TypeId {
    /// Whether a parameter of this type can be converted into an Arrow array
    /// for an OLAP program parameter batch.
    pub fn is_arrow_compatible(&self) -> bool {
        // Every scalar type currently maps onto an Arrow type; decimals use
        // the default (22, 9) precision/scale.
        true
    }

    /// Numeric id used on the wire. The values are part of the protocol.
    pub fn to_wire(self) -> i32 {
        match self {
            TypeId::Int32 => 1,
            TypeId::Uint32 => 2,
            TypeId::Int64 => 3,
            TypeId::Uint64 => 4,
            TypeId::Bool => 6,
            TypeId::Float64 => 32,
            TypeId::TimestampUs => 50,
            TypeId::Utf8 => 4608,
            TypeId::Decimal => 4865,
        }
    }

    pub fn from_wire(value: i32) -> Option<Self> {
        Some(match value {
            1 => TypeId::Int32,
            2 => TypeId::Uint32,
            3 => TypeId::Int64,
            4 => TypeId::Uint64,
            6 => TypeId::Bool,
            32 => TypeId::Float64,
            50 => TypeId::TimestampUs,
            4608 => TypeId::Utf8,
            4865 => TypeId::Decimal,
            _ => return None,
        })
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeId::Bool => "Bool",
            TypeId::Int32 => "Int32",
            TypeId::Int64 => "Int64",
            TypeId::Uint32 => "Uint32",
            TypeId::Uint64 => "Uint64",
            TypeId::Float64 => "Double",
            TypeId::Utf8 => "Utf8",
            TypeId::TimestampUs => "Timestamp",
            TypeId::Decimal => "Decimal",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScalarImpl {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Uint32(u32),
    Uint64(u64),
    Float64(f64),
    Utf8(Box<str>),
    TimestampUs(i64),
    Decimal(i128),
}

impl ScalarImpl {
    pub fn type_id(&self) -> TypeId {
        match self {
            ScalarImpl::Bool(_) => TypeId::Bool,
            ScalarImpl::Int32(_) => TypeId::Int32,
            ScalarImpl::Int64(_) => TypeId::Int64,
            ScalarImpl::Uint32(_) => TypeId::Uint32,
            ScalarImpl::Uint64(_) => TypeId::Uint64,
            ScalarImpl::Float64(_) => TypeId::Float64,
            ScalarImpl::Utf8(_) => TypeId::Utf8,
            ScalarImpl::TimestampUs(_) => TypeId::TimestampUs,
            ScalarImpl::Decimal(_) => TypeId::Decimal,
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            ScalarImpl::Bool(v) => v.to_string(),
            ScalarImpl::Int32(v) => v.to_string(),
            ScalarImpl::Int64(v) => v.to_string(),
            ScalarImpl::Uint32(v) => v.to_string(),
            ScalarImpl::Uint64(v) => v.to_string(),
            ScalarImpl::Float64(v) => v.to_string(),
            ScalarImpl::Utf8(v) => v.to_string(),
            ScalarImpl::TimestampUs(v) => v.to_string(),
            ScalarImpl::Decimal(v) => v.to_string(),
        }
    }
}

pub type Datum = Option<ScalarImpl>;

/// Type-aware comparison of two cells of the same column. Nulls order first.
pub fn cmp_datum(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => cmp_scalar(x, y),
    }
}

fn cmp_scalar(a: &ScalarImpl, b: &ScalarImpl) -> Ordering {
    use ScalarImpl::*;
    match (a, b) {
        (Bool(x), Bool(y)) => x.cmp(y),
        (Int32(x), Int32(y)) => x.cmp(y),
        (Int64(x), Int64(y)) => x.cmp(y),
        (Uint32(x), Uint32(y)) => x.cmp(y),
        (Uint64(x), Uint64(y)) => x.cmp(y),
        (Float64(x), Float64(y)) => x.total_cmp(y),
        (Utf8(x), Utf8(y)) => x.cmp(y),
        (TimestampUs(x), TimestampUs(y)) => x.cmp(y),
        (Decimal(x), Decimal(y)) => x.cmp(y),
        _ => panic!(
            "cannot compare cells of different types: {} vs {}",
            a.type_id(),
            b.type_id()
        ),
    }
}

/// A tuple of key cells, the in-memory form of a serialized key point.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct CellVec {
    cells: Vec<Datum>,
}

impl CellVec {
    pub fn new(cells: Vec<Datum>) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[Datum] {
        &self.cells
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Order-preserving encoding of the cell tuple.
    pub fn encode(&self) -> Vec<u8> {
        let mut serializer = memcomparable::Serializer::new(vec![]);
        for cell in &self.cells {
            serialize_datum(cell, &mut serializer).expect("memcomparable encoding never fails");
        }
        serializer.into_inner()
    }

    pub fn decode(types: &[TypeId], buf: &[u8]) -> memcomparable::Result<Self> {
        let mut deserializer = memcomparable::Deserializer::new(buf);
        let cells = types
            .iter()
            .map(|ty| deserialize_datum(*ty, &mut deserializer))
            .collect::<memcomparable::Result<Vec<_>>>()?;
        Ok(Self { cells })
    }

    /// Lexicographic comparison against another cell tuple; a prefix orders
    /// before any tuple it prefixes.
    pub fn cmp_with(&self, other: &CellVec) -> Ordering {
        for (a, b) in self.cells.iter().zip(other.cells.iter()) {
            match cmp_datum(a, b) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        self.cells.len().cmp(&other.cells.len())
    }

    pub fn display_text(&self) -> String {
        let parts = self
            .cells
            .iter()
            .map(|c| match c {
                None => "null".to_owned(),
                Some(s) => s.as_text(),
            })
            .join(", ");
        format!("({})", parts)
    }
}

impl From<Vec<Datum>> for CellVec {
    fn from(cells: Vec<Datum>) -> Self {
        Self::new(cells)
    }
}

fn serialize_datum(
    datum: &Datum,
    serializer: &mut memcomparable::Serializer<Vec<u8>>,
) -> memcomparable::Result<()> {
    use serde::Serialize as _;
    match datum {
        // Null flag byte orders nulls first.
        None => 0u8.serialize(&mut *serializer),
        Some(scalar) => {
            1u8.serialize(&mut *serializer)?;
            match scalar {
                ScalarImpl::Bool(v) => v.serialize(&mut *serializer),
                ScalarImpl::Int32(v) => v.serialize(&mut *serializer),
                ScalarImpl::Int64(v) => v.serialize(&mut *serializer),
                ScalarImpl::Uint32(v) => v.serialize(&mut *serializer),
                ScalarImpl::Uint64(v) => v.serialize(&mut *serializer),
                ScalarImpl::Float64(v) => v.serialize(&mut *serializer),
                ScalarImpl::Utf8(v) => v.serialize(&mut *serializer),
                ScalarImpl::TimestampUs(v) => v.serialize(&mut *serializer),
                ScalarImpl::Decimal(v) => {
                    // Split into (hi, lo) halves; comparing hi then lo is
                    // equivalent to comparing the i128.
                    let hi = (*v >> 64) as i64;
                    let lo = *v as u64;
                    hi.serialize(&mut *serializer)?;
                    lo.serialize(&mut *serializer)
                }
            }
        }
    }
}

fn deserialize_datum(
    ty: TypeId,
    deserializer: &mut memcomparable::Deserializer<&[u8]>,
) -> memcomparable::Result<Datum> {
    use serde::Deserialize as _;
    let flag = u8::deserialize(&mut *deserializer)?;
    if flag == 0 {
        return Ok(None);
    }
    let scalar = match ty {
        TypeId::Bool => ScalarImpl::Bool(bool::deserialize(&mut *deserializer)?),
        TypeId::Int32 => ScalarImpl::Int32(i32::deserialize(&mut *deserializer)?),
        TypeId::Int64 => ScalarImpl::Int64(i64::deserialize(&mut *deserializer)?),
        TypeId::Uint32 => ScalarImpl::Uint32(u32::deserialize(&mut *deserializer)?),
        TypeId::Uint64 => ScalarImpl::Uint64(u64::deserialize(&mut *deserializer)?),
        TypeId::Float64 => ScalarImpl::Float64(f64::deserialize(&mut *deserializer)?),
        TypeId::Utf8 => ScalarImpl::Utf8(String::deserialize(&mut *deserializer)?.into()),
        TypeId::TimestampUs => ScalarImpl::TimestampUs(i64::deserialize(&mut *deserializer)?),
        TypeId::Decimal => {
            let hi = i64::deserialize(&mut *deserializer)?;
            let lo = u64::deserialize(&mut *deserializer)?;
            ScalarImpl::Decimal(((hi as i128) << 64) | lo as i128)
        }
    };
    Ok(Some(scalar))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_vec(values: &[i64]) -> CellVec {
        CellVec::new(values.iter().map(|v| Some(ScalarImpl::Int64(*v))).collect())
    }

    #[test]
    fn test_cell_vec_roundtrip() {
        let cells = CellVec::new(vec![
            Some(ScalarImpl::Int64(42)),
            None,
            Some(ScalarImpl::Utf8("tide".into())),
        ]);
        let buf = cells.encode();
        let decoded =
            CellVec::decode(&[TypeId::Int64, TypeId::Utf8, TypeId::Utf8], &buf).unwrap();
        assert_eq!(decoded, cells);
    }

    #[test]
    fn test_cell_vec_ordering() {
        assert_eq!(int_vec(&[1, 2]).cmp_with(&int_vec(&[1, 3])), Ordering::Less);
        assert_eq!(int_vec(&[1]).cmp_with(&int_vec(&[1, 0])), Ordering::Less);
        assert_eq!(int_vec(&[2]).cmp_with(&int_vec(&[1, 9])), Ordering::Greater);
        // Nulls order before any value.
        let with_null = CellVec::new(vec![None]);
        assert_eq!(with_null.cmp_with(&int_vec(&[i64::MIN])), Ordering::Less);
    }

    #[test]
    fn test_decimal_halves_preserve_order() {
        let values = [-3i128, -1, 0, 1, i128::from(i64::MAX) + 5];
        for w in values.windows(2) {
            let a = CellVec::new(vec![Some(ScalarImpl::Decimal(w[0]))]);
            let b = CellVec::new(vec![Some(ScalarImpl::Decimal(w[1]))]);
            assert_eq!(a.cmp_with(&b), Ordering::Less);
            let decoded = CellVec::decode(&[TypeId::Decimal], &a.encode()).unwrap();
            assert_eq!(decoded, a);
        }
    }
}
