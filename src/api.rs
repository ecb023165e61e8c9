#![allow(non_snake_case)]
use libloading::{Library, Symbol};
use std::os::raw::c_char;

use crate::sys::*;

pub struct Api {
    pub lbug_destroy_string: unsafe extern "C" fn(*mut c_char),
    pub lbug_default_system_config: unsafe extern "C" fn() -> lbug_system_config,

    pub lbug_database_init: unsafe extern "C" fn(
        *const c_char,
        lbug_system_config,
        *mut lbug_database,
    ) -> lbug_state,
    pub lbug_database_destroy: unsafe extern "C" fn(*mut lbug_database),

    pub lbug_connection_init:
        unsafe extern "C" fn(*mut lbug_database, *mut lbug_connection) -> lbug_state,
    pub lbug_connection_destroy: unsafe extern "C" fn(*mut lbug_connection),
    pub lbug_connection_query: unsafe extern "C" fn(
        *mut lbug_connection,
        *const c_char,
        *mut lbug_query_result,
    ) -> lbug_state,

    pub lbug_query_result_destroy: unsafe extern "C" fn(*mut lbug_query_result),
    pub lbug_query_result_is_success: unsafe extern "C" fn(*mut lbug_query_result) -> bool,
    pub lbug_query_result_get_error_message:
        unsafe extern "C" fn(*mut lbug_query_result) -> *mut c_char,
    pub lbug_query_result_get_num_columns: unsafe extern "C" fn(*mut lbug_query_result) -> u64,
    pub lbug_query_result_get_column_name:
        unsafe extern "C" fn(*mut lbug_query_result, u64, *mut *mut c_char) -> lbug_state,
    pub lbug_query_result_has_next: unsafe extern "C" fn(*mut lbug_query_result) -> bool,
    pub lbug_query_result_get_next:
        unsafe extern "C" fn(*mut lbug_query_result, *mut lbug_flat_tuple) -> lbug_state,

    pub lbug_flat_tuple_destroy: unsafe extern "C" fn(*mut lbug_flat_tuple),
    pub lbug_flat_tuple_get_value:
        unsafe extern "C" fn(*mut lbug_flat_tuple, u64, *mut lbug_value) -> lbug_state,

    pub lbug_value_destroy: unsafe extern "C" fn(*mut lbug_value),
    pub lbug_value_is_null: unsafe extern "C" fn(*mut lbug_value) -> bool,
    pub lbug_value_get_data_type:
        unsafe extern "C" fn(*mut lbug_value, *mut lbug_logical_type) -> lbug_state,
    pub lbug_data_type_get_id: unsafe extern "C" fn(*mut lbug_logical_type) -> lbug_data_type_id,
    pub lbug_data_type_destroy: unsafe extern "C" fn(*mut lbug_logical_type),

    pub lbug_value_get_bool: unsafe extern "C" fn(*mut lbug_value, *mut bool) -> lbug_state,
    pub lbug_value_get_int8: unsafe extern "C" fn(*mut lbug_value, *mut i8) -> lbug_state,
    pub lbug_value_get_int16: unsafe extern "C" fn(*mut lbug_value, *mut i16) -> lbug_state,
    pub lbug_value_get_int32: unsafe extern "C" fn(*mut lbug_value, *mut i32) -> lbug_state,
    pub lbug_value_get_int64: unsafe extern "C" fn(*mut lbug_value, *mut i64) -> lbug_state,
    pub lbug_value_get_uint8: unsafe extern "C" fn(*mut lbug_value, *mut u8) -> lbug_state,
    pub lbug_value_get_uint16: unsafe extern "C" fn(*mut lbug_value, *mut u16) -> lbug_state,
    pub lbug_value_get_uint32: unsafe extern "C" fn(*mut lbug_value, *mut u32) -> lbug_state,
    pub lbug_value_get_uint64: unsafe extern "C" fn(*mut lbug_value, *mut u64) -> lbug_state,
    pub lbug_value_get_float: unsafe extern "C" fn(*mut lbug_value, *mut f32) -> lbug_state,
    pub lbug_value_get_double: unsafe extern "C" fn(*mut lbug_value, *mut f64) -> lbug_state,
    pub lbug_value_get_string:
        unsafe extern "C" fn(*mut lbug_value, *mut *mut c_char) -> lbug_state,
    pub lbug_value_get_list_size: unsafe extern "C" fn(*mut lbug_value, *mut u64) -> lbug_state,
    pub lbug_value_get_list_element:
        unsafe extern "C" fn(*mut lbug_value, u64, *mut lbug_value) -> lbug_state,
    pub lbug_value_get_struct_num_fields:
        unsafe extern "C" fn(*mut lbug_value, *mut u64) -> lbug_state,
    pub lbug_value_get_struct_field_name:
        unsafe extern "C" fn(*mut lbug_value, u64, *mut *mut c_char) -> lbug_state,
    pub lbug_value_get_struct_field_value:
        unsafe extern "C" fn(*mut lbug_value, u64, *mut lbug_value) -> lbug_state,
    pub lbug_value_to_string: unsafe extern "C" fn(*mut lbug_value) -> *mut c_char,
}

impl Api {
    /// Resolve every ABI entrypoint from `lib`.
    ///
    /// # Safety
    ///
    /// `lib` must be an lbug runtime exporting these symbols with exactly these signatures, and it
    /// must stay loaded for as long as the returned [`Api`] is used.
    pub unsafe fn load(lib: &Library) -> Result<Self, libloading::Error> {
        unsafe fn get<T: Copy>(
            lib: &Library,
            name: &'static [u8],
        ) -> Result<T, libloading::Error> {
            let sym: Symbol<T> = lib.get::<T>(name)?;
            Ok(*sym)
        }
        macro_rules! sym {
            ($name:ident) => {
                get(lib, concat!(stringify!($name), "\0").as_bytes())?
            };
        }
        Ok(Self {
            lbug_destroy_string: sym!(lbug_destroy_string),
            lbug_default_system_config: sym!(lbug_default_system_config),
            lbug_database_init: sym!(lbug_database_init),
            lbug_database_destroy: sym!(lbug_database_destroy),
            lbug_connection_init: sym!(lbug_connection_init),
            lbug_connection_destroy: sym!(lbug_connection_destroy),
            lbug_connection_query: sym!(lbug_connection_query),
            lbug_query_result_destroy: sym!(lbug_query_result_destroy),
            lbug_query_result_is_success: sym!(lbug_query_result_is_success),
            lbug_query_result_get_error_message: sym!(lbug_query_result_get_error_message),
            lbug_query_result_get_num_columns: sym!(lbug_query_result_get_num_columns),
            lbug_query_result_get_column_name: sym!(lbug_query_result_get_column_name),
            lbug_query_result_has_next: sym!(lbug_query_result_has_next),
            lbug_query_result_get_next: sym!(lbug_query_result_get_next),
            lbug_flat_tuple_destroy: sym!(lbug_flat_tuple_destroy),
            lbug_flat_tuple_get_value: sym!(lbug_flat_tuple_get_value),
            lbug_value_destroy: sym!(lbug_value_destroy),
            lbug_value_is_null: sym!(lbug_value_is_null),
            lbug_value_get_data_type: sym!(lbug_value_get_data_type),
            lbug_data_type_get_id: sym!(lbug_data_type_get_id),
            lbug_data_type_destroy: sym!(lbug_data_type_destroy),
            lbug_value_get_bool: sym!(lbug_value_get_bool),
            lbug_value_get_int8: sym!(lbug_value_get_int8),
            lbug_value_get_int16: sym!(lbug_value_get_int16),
            lbug_value_get_int32: sym!(lbug_value_get_int32),
            lbug_value_get_int64: sym!(lbug_value_get_int64),
            lbug_value_get_uint8: sym!(lbug_value_get_uint8),
            lbug_value_get_uint16: sym!(lbug_value_get_uint16),
            lbug_value_get_uint32: sym!(lbug_value_get_uint32),
            lbug_value_get_uint64: sym!(lbug_value_get_uint64),
            lbug_value_get_float: sym!(lbug_value_get_float),
            lbug_value_get_double: sym!(lbug_value_get_double),
            lbug_value_get_string: sym!(lbug_value_get_string),
            lbug_value_get_list_size: sym!(lbug_value_get_list_size),
            lbug_value_get_list_element: sym!(lbug_value_get_list_element),
            lbug_value_get_struct_num_fields: sym!(lbug_value_get_struct_num_fields),
            lbug_value_get_struct_field_name: sym!(lbug_value_get_struct_field_name),
            lbug_value_get_struct_field_value: sym!(lbug_value_get_struct_field_value),
            lbug_value_to_string: sym!(lbug_value_to_string),
        })
    }
}
