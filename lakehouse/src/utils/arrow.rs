use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Float64Type, Int32Type, Int64Type, TimeUnit, TimestampMicrosecondType,
    TimestampMillisecondType, TimestampNanosecondType, TimestampSecondType,
};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, SecondsFormat, Utc};
use common::{Error, Result};
use serde_json::{Number, Value};

/// Renders batches as JSON objects keyed by column name, for logging sample rows.
pub fn batches_to_json(batches: &[RecordBatch]) -> Result<Vec<Value>> {
    let mut json_rows = Vec::new();

    for batch in batches {
        let schema = batch.schema();
        for row_idx in 0..batch.num_rows() {
            let mut row = serde_json::Map::new();

            for (col_idx, field) in schema.fields().iter().enumerate() {
                let value = arrow_array_to_json(batch.column(col_idx), row_idx)?;
                row.insert(field.name().clone(), value);
            }

            json_rows.push(Value::Object(row));
        }
    }

    Ok(json_rows)
}

pub fn arrow_array_to_json(array: &dyn Array, index: usize) -> Result<Value> {
    if array.is_null(index) {
        return Ok(Value::Null);
    }

    Ok(match array.data_type() {
        DataType::Int32 => Value::from(array.as_primitive::<Int32Type>().value(index)),
        DataType::Int64 => Value::from(array.as_primitive::<Int64Type>().value(index)),
        DataType::Float64 => {
            let value = array.as_primitive::<Float64Type>().value(index);
            Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
        }
        DataType::Boolean => Value::Bool(array.as_boolean().value(index)),
        DataType::Utf8 => Value::String(array.as_string::<i32>().value(index).to_string()),
        DataType::LargeUtf8 => Value::String(array.as_string::<i64>().value(index).to_string()),
        DataType::Utf8View => Value::String(array.as_string_view().value(index).to_string()),
        DataType::Timestamp(unit, _) => {
            let nanos = match unit {
                TimeUnit::Second => array
                    .as_primitive::<TimestampSecondType>()
                    .value(index)
                    .checked_mul(1_000_000_000),
                TimeUnit::Millisecond => array
                    .as_primitive::<TimestampMillisecondType>()
                    .value(index)
                    .checked_mul(1_000_000),
                TimeUnit::Microsecond => array
                    .as_primitive::<TimestampMicrosecondType>()
                    .value(index)
                    .checked_mul(1_000),
                TimeUnit::Nanosecond => Some(array.as_primitive::<TimestampNanosecondType>().value(index)),
            }
            .ok_or_else(|| Error::InvalidInput("Timestamp out of range".to_string()))?;

            let datetime = DateTime::<Utc>::from_timestamp_nanos(nanos);
            Value::String(datetime.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        DataType::Dictionary(_, _) => {
            let value = arrow::compute::cast(&array.slice(index, 1), &DataType::Utf8)?;
            Value::String(value.as_string::<i32>().value(0).to_string())
        }
        other => {
            return Err(Error::InvalidInput(format!(
                "Cannot render {:?} as JSON",
                other
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{DictionaryArray, Int32Array, StringArray, TimestampNanosecondArray};
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    #[test]
    fn test_batches_to_json() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("user_id", DataType::Int32, true),
            Field::new("level", DataType::Utf8, true),
            Field::new(
                "start_time",
                DataType::Timestamp(TimeUnit::Nanosecond, None),
                false,
            ),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(26), None])),
                Arc::new(StringArray::from(vec![Some("free"), Some("paid")])),
                Arc::new(TimestampNanosecondArray::from(vec![
                    1_541_290_555_796_000_000,
                    0,
                ])),
            ],
        )
        .unwrap();

        let rows = batches_to_json(&[batch]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["user_id"], 26);
        assert_eq!(rows[0]["start_time"], "2018-11-04T00:15:55.796Z");
        assert_eq!(rows[1]["user_id"], Value::Null);
        assert_eq!(rows[1]["level"], "paid");
    }

    #[test]
    fn test_dictionary_values_render_as_strings() {
        let array: DictionaryArray<Int32Type> = vec!["A1", "A2", "A1"].into_iter().collect();
        assert_eq!(arrow_array_to_json(&array, 2).unwrap(), "A1");
        assert_eq!(arrow_array_to_json(&array, 1).unwrap(), "A2");
    }
}
