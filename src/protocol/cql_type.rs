//! CQL column *type descriptors*, as carried in result/prepared metadata
//! (§4.1, RESULT body). This stops at describing the shape of a column's
//! type — it does not decode column values, which stays the external
//! `Encoder` collaborator's job (§6, Non-goals).

use crate::error::{Error, Result};
use crate::protocol::primitive::FrameReader;

#[derive(Debug, Clone, PartialEq)]
pub enum CqlType {
    Custom(String),
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    Smallint,
    Tinyint,
    Duration,
    List(Box<CqlType>),
    Map(Box<CqlType>, Box<CqlType>),
    Set(Box<CqlType>),
    Udt {
        keyspace: String,
        name: String,
        fields: Vec<(String, CqlType)>,
    },
    Tuple(Vec<CqlType>),
}

impl CqlType {
    pub fn read(r: &mut FrameReader<'_>) -> Result<Self> {
        let id = r.read_short()?;
        Ok(match id {
            0x0000 => CqlType::Custom(r.read_string()?.to_string()),
            0x0001 => CqlType::Ascii,
            0x0002 => CqlType::Bigint,
            0x0003 => CqlType::Blob,
            0x0004 => CqlType::Boolean,
            0x0005 => CqlType::Counter,
            0x0006 => CqlType::Decimal,
            0x0007 => CqlType::Double,
            0x0008 => CqlType::Float,
            0x0009 => CqlType::Int,
            0x000B => CqlType::Timestamp,
            0x000C => CqlType::Uuid,
            0x000D => CqlType::Varchar,
            0x000E => CqlType::Varint,
            0x000F => CqlType::Timeuuid,
            0x0010 => CqlType::Inet,
            0x0011 => CqlType::Date,
            0x0012 => CqlType::Time,
            0x0013 => CqlType::Smallint,
            0x0014 => CqlType::Tinyint,
            0x0015 => CqlType::Duration,
            0x0020 => CqlType::List(Box::new(CqlType::read(r)?)),
            0x0021 => {
                let key = CqlType::read(r)?;
                let value = CqlType::read(r)?;
                CqlType::Map(Box::new(key), Box::new(value))
            }
            0x0022 => CqlType::Set(Box::new(CqlType::read(r)?)),
            0x0030 => {
                let keyspace = r.read_string()?.to_string();
                let name = r.read_string()?.to_string();
                let count = r.read_short()?;
                let mut fields = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let field_name = r.read_string()?.to_string();
                    let field_type = CqlType::read(r)?;
                    fields.push((field_name, field_type));
                }
                CqlType::Udt {
                    keyspace,
                    name,
                    fields,
                }
            }
            0x0031 => {
                let count = r.read_short()?;
                let mut types = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    types.push(CqlType::read(r)?);
                }
                CqlType::Tuple(types)
            }
            other => {
                return Err(Error::ProtocolError(format!(
                    "unrecognized CQL type option id 0x{other:04x}"
                )));
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub type_spec: CqlType,
}
