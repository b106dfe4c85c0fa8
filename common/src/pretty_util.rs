use std::fmt::Debug;
use std::time::Duration;

use byte_unit::{Byte, UnitType};
use pretty_duration::pretty_duration;
use serde::Serialize;

use crate::config::load_style::Format;

/// Duration 的格式化输出
pub fn to_duration_pretty(duration: &Duration) -> String {
    pretty_duration(duration, None)
}

/// 字节大小 的格式化输出
pub fn to_bytes_len_pretty(len: usize) -> String {
    let byte = Byte::from_u64(len as u64);
    let adjusted_byte = byte.get_appropriate_unit(UnitType::Decimal);

    format!("{adjusted_byte:.2}")
}

pub fn to_string_pretty<T: Sized + Serialize + Debug>(f: &Format, val: &T) -> String {
    match f {
        Format::Json => match serde_json::to_string_pretty(val) {
            Ok(v) => v,
            Err(_) => format!("to_string_pretty Json error:{:?}", val),
        },
        Format::Yaml => match serde_yaml::to_string(val) {
            Ok(v) => v,
            Err(_) => format!("to_string_pretty Yaml error:{:?}", val),
        },
        Format::None => {
            format!("{:?}", val)
        }
    }
}
