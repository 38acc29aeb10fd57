use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use byteorder::ReadBytesExt;
use bytes::{BufMut, BytesMut};

use crate::codec::{Codec, RefAllocator, RefResolver};
use crate::error::{CResult, Error};
use crate::object::{PObject, StateMap, Value};
use crate::types::{p64, u64 as id_u64, Oid};

/// Key marking a reference object in the encoded state. State maps may not
/// use it as a field name.
const REF_KEY: &str = "$oid";

/// The default codec: object state as a length-prefixed JSON frame.
///
/// The structure of a frame is:
///
/// - Body length as big-endian u64.
/// - Body: a JSON object `{"resolvable": bool, "state": {...}}` where
///   references appear as `{"$oid": "<16 hex digits>"}`.
#[derive(Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        JsonCodec
    }

    fn encode_frame(resolvable: bool, state: serde_json::Value) -> CResult<Vec<u8>> {
        let body = serde_json::to_vec(&serde_json::json!({
            "resolvable": resolvable,
            "state": state,
        }))?;
        let mut buf = BytesMut::with_capacity(8 + body.len());
        buf.put_u64(body.len() as u64);
        buf.put(body.as_slice());
        Ok(buf.to_vec())
    }

    fn decode_frame(data: &[u8]) -> CResult<(bool, serde_json::Value)> {
        let mut cursor = Cursor::new(data);
        let len = cursor
            .read_u64::<byteorder::BigEndian>()
            .map_err(|_| Error::Parse("frame shorter than its length header".to_string()))?
            as usize;
        let body = &data[8..];
        if body.len() != len {
            return Err(Error::Parse(format!(
                "frame length mismatch: header says {}, body is {}",
                len,
                body.len()
            )));
        }
        let frame: serde_json::Value = serde_json::from_slice(body)?;
        let resolvable = frame
            .get("resolvable")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let state = frame
            .get("state")
            .cloned()
            .ok_or_else(|| Error::Parse("frame has no state".to_string()))?;
        Ok((resolvable, state))
    }

    fn value_to_json(value: &Value, refs: &mut dyn RefAllocator) -> CResult<serde_json::Value> {
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Text(s) => serde_json::Value::from(s.as_str()),
            Value::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| Self::value_to_json(v, refs))
                    .collect::<CResult<_>>()?,
            ),
            Value::Map(map) => {
                if map.contains_key(REF_KEY) {
                    return Err(Error::Parse(format!(
                        "state maps may not use the reserved key {:?}",
                        REF_KEY
                    )));
                }
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), Self::value_to_json(v, refs)?);
                }
                serde_json::Value::Object(out)
            }
            Value::Ref(obj) => {
                let oid = refs.reserve(obj)?;
                let mut reference = serde_json::Map::new();
                reference.insert(
                    REF_KEY.to_string(),
                    serde_json::Value::from(format!("{:016x}", id_u64(&oid))),
                );
                serde_json::Value::Object(reference)
            }
        })
    }

    fn json_to_value(json: &serde_json::Value, refs: &mut dyn RefResolver) -> CResult<Value> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => return Err(Error::Parse(format!("unsupported number {}", n))),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => Value::List(
                items
                    .iter()
                    .map(|v| Self::json_to_value(v, refs))
                    .collect::<CResult<_>>()?,
            ),
            serde_json::Value::Object(map) => {
                if let Some(marker) = map.get(REF_KEY) {
                    if map.len() != 1 {
                        return Err(Error::Parse(
                            "reference object carries extra keys".to_string(),
                        ));
                    }
                    let oid = Self::parse_oid(marker)?;
                    Value::Ref(refs.resolve(oid)?)
                } else {
                    let mut out = BTreeMap::new();
                    for (k, v) in map {
                        out.insert(k.clone(), Self::json_to_value(v, refs)?);
                    }
                    Value::Map(out)
                }
            }
        })
    }

    fn parse_oid(marker: &serde_json::Value) -> CResult<Oid> {
        let hex = marker
            .as_str()
            .ok_or_else(|| Error::Parse("reference oid is not a string".to_string()))?;
        if hex.len() != 16 {
            return Err(Error::Parse(format!("bad reference oid {:?}", hex)));
        }
        let n = u64::from_str_radix(hex, 16)
            .map_err(|_| Error::Parse(format!("bad reference oid {:?}", hex)))?;
        Ok(p64(n))
    }

    fn decode_state(data: &[u8], refs: &mut dyn RefResolver) -> CResult<(bool, StateMap)> {
        let (resolvable, state) = Self::decode_frame(data)?;
        let fields = match state {
            serde_json::Value::Object(fields) => fields,
            other => return Err(Error::Parse(format!("state is not an object: {}", other))),
        };
        let mut map = StateMap::new();
        for (k, v) in &fields {
            map.insert(k.clone(), Self::json_to_value(v, refs)?);
        }
        Ok((resolvable, map))
    }
}

impl Codec for JsonCodec {
    fn get_ghost(&self, data: &[u8]) -> CResult<Arc<PObject>> {
        let (resolvable, _) = Self::decode_frame(data)?;
        Ok(PObject::shell(resolvable))
    }

    fn set_ghost_state(
        &self,
        obj: &Arc<PObject>,
        data: &[u8],
        refs: &mut dyn RefResolver,
    ) -> CResult<()> {
        let (resolvable, state) = Self::decode_state(data, refs)?;
        obj.set_resolvable(resolvable);
        obj.set_state(state);
        Ok(())
    }

    fn get_state(&self, data: &[u8], refs: &mut dyn RefResolver) -> CResult<StateMap> {
        Ok(Self::decode_state(data, refs)?.1)
    }

    fn serialize(&self, obj: &Arc<PObject>, refs: &mut dyn RefAllocator) -> CResult<Vec<u8>> {
        let state = obj.state()?;
        let mut fields = serde_json::Map::new();
        for (k, v) in &state {
            fields.insert(k.clone(), Self::value_to_json(v, refs)?);
        }
        Self::encode_frame(obj.resolvable(), serde_json::Value::Object(fields))
    }
}
