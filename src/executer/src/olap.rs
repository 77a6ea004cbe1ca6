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

//! OLAP program parameters shipped to column shards as an Arrow record
//! batch of one row.

use std::collections::HashSet;
use std::sync::Arc;

use arrow_array::{
    ArrayRef, BooleanArray, Decimal128Array, Float64Array, Int32Array, Int64Array, RecordBatch,
    StringArray, TimestampMicrosecondArray, UInt32Array, UInt64Array,
};
use arrow_ipc::writer::StreamWriter;
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use tidewave_common::types::{Datum, ScalarImpl, TypeId};

use crate::error::{BuildError, BuildResult};
use crate::graph::QueryParamsProvider;

fn arrow_type(ty: TypeId) -> DataType {
    match ty {
        TypeId::Bool => DataType::Boolean,
        TypeId::Int32 => DataType::Int32,
        TypeId::Int64 => DataType::Int64,
        TypeId::Uint32 => DataType::UInt32,
        TypeId::Uint64 => DataType::UInt64,
        TypeId::Float64 => DataType::Float64,
        TypeId::Utf8 => DataType::Utf8,
        TypeId::TimestampUs => DataType::Timestamp(TimeUnit::Microsecond, None),
        TypeId::Decimal => DataType::Decimal128(22, 9),
    }
}

fn single_value_array(ty: TypeId, value: &Datum) -> BuildResult<ArrayRef> {
    macro_rules! build {
        ($array:ty, $variant:ident) => {{
            let cell = match value {
                None => None,
                Some(ScalarImpl::$variant(v)) => Some(v.clone()),
                Some(other) => {
                    return Err(BuildError::BadRequest(format!(
                        "parameter value type {} does not match declared type {}",
                        other.type_id(),
                        ty
                    )))
                }
            };
            Arc::new(<$array>::from(vec![cell])) as ArrayRef
        }};
    }

    Ok(match ty {
        TypeId::Bool => build!(BooleanArray, Bool),
        TypeId::Int32 => build!(Int32Array, Int32),
        TypeId::Int64 => build!(Int64Array, Int64),
        TypeId::Uint32 => build!(UInt32Array, Uint32),
        TypeId::Uint64 => build!(UInt64Array, Uint64),
        TypeId::Float64 => build!(Float64Array, Float64),
        TypeId::Utf8 => {
            let cell = match value {
                None => None,
                Some(ScalarImpl::Utf8(v)) => Some(v.to_string()),
                Some(other) => {
                    return Err(BuildError::BadRequest(format!(
                        "parameter value type {} does not match declared type {}",
                        other.type_id(),
                        ty
                    )))
                }
            };
            Arc::new(StringArray::from(vec![cell])) as ArrayRef
        }
        TypeId::TimestampUs => build!(TimestampMicrosecondArray, TimestampUs),
        TypeId::Decimal => {
            let array = build!(Decimal128Array, Decimal);
            let decimal = array
                .as_any()
                .downcast_ref::<Decimal128Array>()
                .expect("just built")
                .clone()
                .with_precision_and_scale(22, 9)
                .map_err(|e| BuildError::Internal(format!("decimal parameter: {}", e)))?;
            Arc::new(decimal) as ArrayRef
        }
    })
}

fn write_ipc_stream(schema: &Arc<Schema>, batch: Option<&RecordBatch>) -> BuildResult<Vec<u8>> {
    let mut buf = Vec::new();
    let mut writer = StreamWriter::try_new(&mut buf, schema)
        .map_err(|e| BuildError::Internal(format!("arrow stream writer: {}", e)))?;
    if let Some(batch) = batch {
        writer
            .write(batch)
            .map_err(|e| BuildError::Internal(format!("arrow batch write: {}", e)))?;
    }
    writer
        .finish()
        .map_err(|e| BuildError::Internal(format!("arrow stream finish: {}", e)))?;
    drop(writer);
    Ok(buf)
}

/// Collects the parameters an OLAP program names, in program-parameter
/// declaration order, into a one-row Arrow record batch. Returns the
/// serialized `(schema, batch)` pair.
pub fn serialize_olap_parameters(
    program_parameters: &[String],
    parameter_names: &HashSet<String>,
    params: &dyn QueryParamsProvider,
) -> BuildResult<(Vec<u8>, Vec<u8>)> {
    let mut fields = Vec::new();
    let mut data: Vec<ArrayRef> = Vec::new();

    if !parameter_names.is_empty() {
        for name in program_parameters {
            if !parameter_names.contains(name) {
                continue;
            }

            let (ty, value) = params.typed_value(name).ok_or_else(|| {
                BuildError::Internal(format!("missing value for OLAP parameter `{}`", name))
            })?;
            if !ty.is_arrow_compatible() {
                return Err(BuildError::BadRequest(format!(
                    "incompatible parameter type {}, can't convert to arrow",
                    ty
                )));
            }

            let array = single_value_array(ty, &value)?;
            fields.push(Field::new(name, arrow_type(ty), true));
            data.push(array);
        }
    }

    let schema = Arc::new(Schema::new(fields));
    let schema_bytes = write_ipc_stream(&schema, None)?;
    let batch = RecordBatch::try_new(schema.clone(), data).map_err(|e| {
        BuildError::Internal(format!("failed to build arrow batch of parameters: {}", e))
    })?;
    let batch_bytes = write_ipc_stream(&schema, Some(&batch))?;

    Ok((schema_bytes, batch_bytes))
}

#[cfg(test)]
mod tests {
    use arrow_ipc::reader::StreamReader;

    use super::*;
    use crate::graph::test_utils::MapParams;

    #[test]
    fn test_parameters_to_arrow_roundtrip() {
        let mut params = MapParams::default();
        params.typed.insert(
            "$limit".to_owned(),
            (TypeId::Int64, Some(ScalarImpl::Int64(10))),
        );
        params.typed.insert(
            "$name".to_owned(),
            (TypeId::Utf8, Some(ScalarImpl::Utf8("tide".into()))),
        );
        params
            .typed
            .insert("$unused".to_owned(), (TypeId::Bool, None));

        let program_parameters = vec![
            "$limit".to_owned(),
            "$name".to_owned(),
            "$unused".to_owned(),
        ];
        let names: HashSet<_> = ["$limit", "$name"].iter().map(|s| s.to_string()).collect();

        let (schema_bytes, batch_bytes) =
            serialize_olap_parameters(&program_parameters, &names, &params).unwrap();

        let reader = StreamReader::try_new(schema_bytes.as_slice(), None).unwrap();
        assert_eq!(reader.schema().fields().len(), 2);

        let mut reader = StreamReader::try_new(batch_bytes.as_slice(), None).unwrap();
        let batch = reader.next().unwrap().unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.schema().field(0).name(), "$limit");
    }

    #[test]
    fn test_mismatched_parameter_type_is_rejected() {
        let mut params = MapParams::default();
        params.typed.insert(
            "$p".to_owned(),
            (TypeId::Int64, Some(ScalarImpl::Utf8("oops".into()))),
        );

        let program_parameters = vec!["$p".to_owned()];
        let names: HashSet<_> = ["$p"].iter().map(|s| s.to_string()).collect();
        let err =
            serialize_olap_parameters(&program_parameters, &names, &params).unwrap_err();
        assert!(matches!(err, BuildError::BadRequest(_)));
    }
}
