#![allow(non_camel_case_types)]
#![allow(dead_code)]
use std::os::raw::c_void;

/// Status returned by most ABI functions.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum lbug_state {
    LbugSuccess = 0,
    LbugError = 1,
}

/// Logical type ids reported by `lbug_data_type_get_id`.
///
/// A plain integer rather than a Rust enum: the engine may report ids this driver does not know,
/// and an out-of-range enum discriminant would be undefined behaviour.
pub type lbug_data_type_id = u32;

pub const LBUG_ANY: lbug_data_type_id = 0;
pub const LBUG_NODE: lbug_data_type_id = 10;
pub const LBUG_REL: lbug_data_type_id = 11;
pub const LBUG_RECURSIVE_REL: lbug_data_type_id = 12;
pub const LBUG_SERIAL: lbug_data_type_id = 13;
pub const LBUG_BOOL: lbug_data_type_id = 22;
pub const LBUG_INT64: lbug_data_type_id = 23;
pub const LBUG_INT32: lbug_data_type_id = 24;
pub const LBUG_INT16: lbug_data_type_id = 25;
pub const LBUG_INT8: lbug_data_type_id = 26;
pub const LBUG_UINT64: lbug_data_type_id = 27;
pub const LBUG_UINT32: lbug_data_type_id = 28;
pub const LBUG_UINT16: lbug_data_type_id = 29;
pub const LBUG_UINT8: lbug_data_type_id = 30;
pub const LBUG_INT128: lbug_data_type_id = 31;
pub const LBUG_DOUBLE: lbug_data_type_id = 32;
pub const LBUG_FLOAT: lbug_data_type_id = 33;
pub const LBUG_STRING: lbug_data_type_id = 50;
pub const LBUG_BLOB: lbug_data_type_id = 51;
pub const LBUG_LIST: lbug_data_type_id = 52;
pub const LBUG_ARRAY: lbug_data_type_id = 53;
pub const LBUG_STRUCT: lbug_data_type_id = 54;
pub const LBUG_MAP: lbug_data_type_id = 55;

/// Engine configuration passed to `lbug_database_init`.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct lbug_system_config {
    pub buffer_pool_size: u64,
    pub max_num_threads: u64,
    pub enable_compression: bool,
    pub read_only: bool,
    pub max_db_size: u64,
    pub auto_checkpoint: bool,
    pub checkpoint_threshold: u64,
    #[cfg(target_os = "macos")]
    pub thread_qos: u32,
}

// Engine objects are small by-value structs wrapping a private pointer. The engine fills them
// through out-parameters and destroys them by address.

#[repr(C)]
#[derive(Debug)]
pub struct lbug_database {
    pub _database: *mut c_void,
}

#[repr(C)]
#[derive(Debug)]
pub struct lbug_connection {
    pub _connection: *mut c_void,
}

#[repr(C)]
#[derive(Debug)]
pub struct lbug_query_result {
    pub _query_result: *mut c_void,
    pub _is_owned_by_cpp: bool,
}

/// A row produced by `lbug_query_result_get_next`. Destroyed with `lbug_flat_tuple_destroy`.
#[repr(C)]
#[derive(Debug)]
pub struct lbug_flat_tuple {
    pub _flat_tuple: *mut c_void,
    pub _is_owned_by_cpp: bool,
}

/// A single value. `lbug_value_destroy` is a no-op for values owned by their tuple.
#[repr(C)]
#[derive(Debug)]
pub struct lbug_value {
    pub _value: *mut c_void,
    pub _is_owned_by_cpp: bool,
}

#[repr(C)]
#[derive(Debug)]
pub struct lbug_logical_type {
    pub _data_type: *mut c_void,
}

macro_rules! empty {
    ($($ty:ident { $($field:ident: $val:expr),* }),* $(,)?) => {
        $(impl $ty {
            pub fn empty() -> Self {
                Self { $($field: $val),* }
            }
        })*
    };
}

empty! {
    lbug_database { _database: std::ptr::null_mut() },
    lbug_connection { _connection: std::ptr::null_mut() },
    lbug_query_result { _query_result: std::ptr::null_mut(), _is_owned_by_cpp: false },
    lbug_flat_tuple { _flat_tuple: std::ptr::null_mut(), _is_owned_by_cpp: false },
    lbug_value { _value: std::ptr::null_mut(), _is_owned_by_cpp: false },
    lbug_logical_type { _data_type: std::ptr::null_mut() },
}
