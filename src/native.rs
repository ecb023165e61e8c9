//! [`Backend`] over the dynamically-loaded lbug C ABI.
//!
//! Engine objects are by-value handle structs owned on the Rust side and destroyed by address.
//! A query result hands out one flat tuple at a time and reuses its storage for the next row, so
//! a [`NativeBuffer`] owns the current tuple itself: the tuple is destroyed when the next fetch
//! replaces it, or in [`Backend::dispose`] ahead of the result. A [`NativeRow`] is only the
//! sequence number of the fetch that produced it; reading a row that has since been replaced
//! fails with [`EngineError::STALE_ROW`].

use std::{
    borrow::Cow,
    cell::UnsafeCell,
    ffi::{CStr, CString},
    fmt,
    os::raw::c_char,
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    api::Api,
    backend::{Backend, CellRef, Execution},
    reclaim::ReclaimMode,
    runtime::{runtime, Runtime},
    sys as ffi, Connection, EngineError, Result,
};

/// Engine configuration for [`Database::open`].
///
/// Zero sizes, thread counts and thresholds mean "let the engine decide".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemConfig {
    pub buffer_pool_size: u64,
    pub max_num_threads: u64,
    pub enable_compression: bool,
    pub read_only: bool,
    pub max_db_size: u64,
    pub auto_checkpoint: bool,
    pub checkpoint_threshold: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            buffer_pool_size: 0,
            max_num_threads: 0,
            enable_compression: true,
            read_only: false,
            max_db_size: 0,
            auto_checkpoint: true,
            checkpoint_threshold: 0,
        }
    }
}

impl SystemConfig {
    /// The defaults the loaded engine itself reports.
    pub fn engine_default() -> Result<Self> {
        let rt = runtime()?;
        let c = unsafe { (rt.api.lbug_default_system_config)() };
        Ok(Self::from(c))
    }

    /// Overlay this config on the engine's defaults, keeping the engine's value for zero fields.
    fn apply_to(self, base: ffi::lbug_system_config) -> ffi::lbug_system_config {
        let or_base = |v: u64, b: u64| if v == 0 { b } else { v };
        ffi::lbug_system_config {
            buffer_pool_size: or_base(self.buffer_pool_size, base.buffer_pool_size),
            max_num_threads: or_base(self.max_num_threads, base.max_num_threads),
            enable_compression: self.enable_compression,
            read_only: self.read_only,
            max_db_size: or_base(self.max_db_size, base.max_db_size),
            auto_checkpoint: self.auto_checkpoint,
            checkpoint_threshold: or_base(self.checkpoint_threshold, base.checkpoint_threshold),
            ..base
        }
    }
}

impl From<ffi::lbug_system_config> for SystemConfig {
    fn from(c: ffi::lbug_system_config) -> Self {
        Self {
            buffer_pool_size: c.buffer_pool_size,
            max_num_threads: c.max_num_threads,
            enable_compression: c.enable_compression,
            read_only: c.read_only,
            max_db_size: c.max_db_size,
            auto_checkpoint: c.auto_checkpoint,
            checkpoint_threshold: c.checkpoint_threshold,
        }
    }
}

/// Copy out and free a string the engine allocated. Null yields an empty vector.
unsafe fn take_bytes(rt: &Runtime, p: *mut c_char) -> Vec<u8> {
    if p.is_null() {
        return Vec::new();
    }
    let bytes = CStr::from_ptr(p).to_bytes().to_vec();
    (rt.api.lbug_destroy_string)(p);
    bytes
}

fn check(state: ffi::lbug_state, what: &str) -> std::result::Result<(), EngineError> {
    if state == ffi::lbug_state::LbugSuccess {
        Ok(())
    } else {
        Err(EngineError::new(state as i32, format!("{what} failed")))
    }
}

fn cstring(s: &str, what: &str) -> std::result::Result<CString, EngineError> {
    CString::new(s).map_err(|_| EngineError::new(EngineError::NUL, format!("{what} contains NUL")))
}

fn utf8(bytes: Vec<u8>, what: &str) -> std::result::Result<String, EngineError> {
    String::from_utf8(bytes)
        .map_err(|_| EngineError::new(EngineError::UTF8, format!("{what} is not utf-8")))
}

// -------------------------- Database --------------------------

struct DatabaseInner {
    rt: Arc<Runtime>,
    db: UnsafeCell<ffi::lbug_database>,
}

// SAFETY: the engine's database object is internally synchronized; the handle struct itself is
// never written after init.
unsafe impl Send for DatabaseInner {}
unsafe impl Sync for DatabaseInner {}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        unsafe { (self.rt.api.lbug_database_destroy)(self.db.get_mut()) };
        debug!("closed lbug database");
    }
}

/// An open lbug database. Clones share the same native database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open (or create) the database at `path`, or an in-memory one for `None`.
    pub fn open(path: Option<&str>, config: SystemConfig) -> Result<Self> {
        let rt = runtime()?;
        let path = path.unwrap_or(":memory:");
        let cpath = cstring(path, "path")?;
        let config = config.apply_to(unsafe { (rt.api.lbug_default_system_config)() });

        let mut db = ffi::lbug_database::empty();
        let state = unsafe { (rt.api.lbug_database_init)(cpath.as_ptr(), config, &mut db) };
        check(state, "lbug_database_init")?;
        if db._database.is_null() {
            return Err(EngineError::new(EngineError::FAILED, "lbug_database_init returned null database").into());
        }
        debug!(path, "opened lbug database");
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                rt,
                db: UnsafeCell::new(db),
            }),
        })
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("runtime", &self.inner.rt.path)
            .finish()
    }
}

// -------------------------- NativeBackend --------------------------

/// One native connection. Dropped only after every result produced through it.
pub struct NativeBackend {
    db: Arc<DatabaseInner>,
    conn: UnsafeCell<ffi::lbug_connection>,
}

// SAFETY: lbug connections serialize queries internally; results are guarded separately.
unsafe impl Send for NativeBackend {}
unsafe impl Sync for NativeBackend {}

impl NativeBackend {
    pub fn open(db: &Database) -> Result<Self> {
        let inner = db.inner.clone();
        let mut conn = ffi::lbug_connection::empty();
        let state = unsafe { (inner.rt.api.lbug_connection_init)(inner.db.get(), &mut conn) };
        check(state, "lbug_connection_init")?;
        if conn._connection.is_null() {
            return Err(EngineError::new(
                EngineError::FAILED,
                "lbug_connection_init returned null connection",
            )
            .into());
        }
        Ok(Self {
            db: inner,
            conn: UnsafeCell::new(conn),
        })
    }

    fn rt(&self) -> &Runtime {
        &self.db.rt
    }

    unsafe fn column_names(
        &self,
        result: &mut ffi::lbug_query_result,
    ) -> std::result::Result<Vec<String>, EngineError> {
        let api = &self.rt().api;
        let count = (api.lbug_query_result_get_num_columns)(result);
        let mut names = Vec::with_capacity(count as usize);
        for i in 0..count {
            let mut p: *mut c_char = std::ptr::null_mut();
            let state = (api.lbug_query_result_get_column_name)(result, i, &mut p);
            let name = take_bytes(self.rt(), p);
            check(state, "lbug_query_result_get_column_name")?;
            names.push(utf8(name, "column name")?);
        }
        Ok(names)
    }

    /// Copy one engine value, and everything nested in it, out of the engine.
    unsafe fn cell_of(
        &self,
        value: &mut OwnedValue<'_>,
    ) -> std::result::Result<CellRef<'static>, EngineError> {
        let api = &self.rt().api;
        let v: *mut ffi::lbug_value = &mut value.raw;
        if (api.lbug_value_is_null)(v) {
            return Ok(CellRef::Null);
        }

        let mut ty = ffi::lbug_logical_type::empty();
        check((api.lbug_value_get_data_type)(v, &mut ty), "lbug_value_get_data_type")?;
        let id = (api.lbug_data_type_get_id)(&mut ty);
        (api.lbug_data_type_destroy)(&mut ty);

        macro_rules! get {
            ($f:ident, $t:ty) => {{
                let mut out = <$t>::default();
                check((api.$f)(v, &mut out), stringify!($f))?;
                out
            }};
        }

        Ok(match id {
            ffi::LBUG_BOOL => CellRef::Bool(get!(lbug_value_get_bool, bool)),
            ffi::LBUG_INT64 | ffi::LBUG_SERIAL => CellRef::Integer(get!(lbug_value_get_int64, i64)),
            ffi::LBUG_INT32 => CellRef::Integer(get!(lbug_value_get_int32, i32).into()),
            ffi::LBUG_INT16 => CellRef::Integer(get!(lbug_value_get_int16, i16).into()),
            ffi::LBUG_INT8 => CellRef::Integer(get!(lbug_value_get_int8, i8).into()),
            ffi::LBUG_UINT32 => CellRef::Integer(get!(lbug_value_get_uint32, u32).into()),
            ffi::LBUG_UINT16 => CellRef::Integer(get!(lbug_value_get_uint16, u16).into()),
            ffi::LBUG_UINT8 => CellRef::Integer(get!(lbug_value_get_uint8, u8).into()),
            ffi::LBUG_UINT64 => {
                let u = get!(lbug_value_get_uint64, u64);
                CellRef::Integer(i64::try_from(u).map_err(|_| {
                    EngineError::new(EngineError::FAILED, format!("UINT64 value {u} exceeds INT64"))
                })?)
            }
            ffi::LBUG_DOUBLE => CellRef::Float(get!(lbug_value_get_double, f64)),
            ffi::LBUG_FLOAT => CellRef::Float(get!(lbug_value_get_float, f32).into()),
            ffi::LBUG_STRING => {
                let mut p: *mut c_char = std::ptr::null_mut();
                let state = (api.lbug_value_get_string)(v, &mut p);
                let bytes = take_bytes(self.rt(), p);
                check(state, "lbug_value_get_string")?;
                CellRef::Text(Cow::Owned(bytes))
            }
            ffi::LBUG_LIST | ffi::LBUG_ARRAY | ffi::LBUG_MAP => {
                let size = get!(lbug_value_get_list_size, u64);
                let mut items = Vec::with_capacity(size as usize);
                for i in 0..size {
                    let mut child = OwnedValue::new(api);
                    check(
                        (api.lbug_value_get_list_element)(v, i, &mut child.raw),
                        "lbug_value_get_list_element",
                    )?;
                    items.push(self.cell_of(&mut child)?);
                }
                CellRef::List(items)
            }
            ffi::LBUG_STRUCT | ffi::LBUG_NODE | ffi::LBUG_REL => {
                let n = get!(lbug_value_get_struct_num_fields, u64);
                let mut fields = Vec::with_capacity(n as usize);
                for i in 0..n {
                    let mut p: *mut c_char = std::ptr::null_mut();
                    let state = (api.lbug_value_get_struct_field_name)(v, i, &mut p);
                    let name = take_bytes(self.rt(), p);
                    check(state, "lbug_value_get_struct_field_name")?;

                    let mut child = OwnedValue::new(api);
                    check(
                        (api.lbug_value_get_struct_field_value)(v, i, &mut child.raw),
                        "lbug_value_get_struct_field_value",
                    )?;
                    fields.push((Cow::Owned(name), self.cell_of(&mut child)?));
                }
                CellRef::Struct(fields)
            }
            // Dates, timestamps, ids, decimals and the rest come back in the engine's text form.
            _ => CellRef::Text(Cow::Owned(take_bytes(self.rt(), (api.lbug_value_to_string)(v)))),
        })
    }
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        unsafe { (self.db.rt.api.lbug_connection_destroy)(self.conn.get_mut()) };
    }
}

/// A value the driver asked the engine for. Destroyed on drop; the engine ignores the destroy
/// for values that still belong to their tuple.
struct OwnedValue<'a> {
    api: &'a Api,
    raw: ffi::lbug_value,
}

impl<'a> OwnedValue<'a> {
    fn new(api: &'a Api) -> Self {
        Self {
            api,
            raw: ffi::lbug_value::empty(),
        }
    }
}

impl Drop for OwnedValue<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.lbug_value_destroy)(&mut self.raw) };
    }
}

struct NativeResult {
    result: ffi::lbug_query_result,
    tuple: Option<ffi::lbug_flat_tuple>,
    /// Sequence number of `tuple`; bumped on every successful fetch.
    seq: u64,
}

// SAFETY: the handle structs are only touched under the owning buffer's mutex.
unsafe impl Send for NativeResult {}

impl NativeResult {
    /// The tuple `row` was read from, if no later fetch has replaced it.
    fn tuple_for(
        &mut self,
        row: &NativeRow,
    ) -> std::result::Result<&mut ffi::lbug_flat_tuple, EngineError> {
        match self.tuple.as_mut() {
            Some(t) if self.seq == row.seq => Ok(t),
            _ => Err(EngineError::new(
                EngineError::STALE_ROW,
                format!("row {} was replaced by a later fetch", row.seq),
            )),
        }
    }

    unsafe fn destroy_tuple(&mut self, api: &Api) {
        if let Some(mut t) = self.tuple.take() {
            (api.lbug_flat_tuple_destroy)(&mut t);
        }
    }
}

/// A native query result together with the one tuple it currently exposes.
pub struct NativeBuffer(Mutex<NativeResult>);

/// Sequence number of one fetched row within its [`NativeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeRow {
    seq: u64,
}

impl Backend for NativeBackend {
    type Buffer = NativeBuffer;
    type Row = NativeRow;

    fn execute(&self, query: &str) -> std::result::Result<Execution<NativeBuffer>, EngineError> {
        let rt = self.rt();
        let api = &rt.api;
        let q = cstring(query, "query")?;
        let mut result = ffi::lbug_query_result::empty();

        unsafe {
            let state = (api.lbug_connection_query)(self.conn.get(), q.as_ptr(), &mut result);
            if result._query_result.is_null() {
                check(state, "lbug_connection_query")?;
                return Err(EngineError::new(
                    EngineError::FAILED,
                    "lbug_connection_query returned null result",
                ));
            }
            // A failed query still hands back a result object carrying the message; it has to be
            // destroyed either way.
            if state != ffi::lbug_state::LbugSuccess || !(api.lbug_query_result_is_success)(&mut result) {
                let message = take_bytes(rt, (api.lbug_query_result_get_error_message)(&mut result));
                (api.lbug_query_result_destroy)(&mut result);
                return Err(EngineError::new(
                    ffi::lbug_state::LbugError as i32,
                    String::from_utf8_lossy(&message).into_owned(),
                ));
            }

            match self.column_names(&mut result) {
                Ok(columns) => Ok(Execution {
                    buffer: NativeBuffer(Mutex::new(NativeResult {
                        result,
                        tuple: None,
                        seq: 0,
                    })),
                    columns,
                }),
                Err(e) => {
                    (api.lbug_query_result_destroy)(&mut result);
                    Err(e)
                }
            }
        }
    }

    unsafe fn fetch_next_row(
        &self,
        buffer: &NativeBuffer,
    ) -> std::result::Result<Option<NativeRow>, EngineError> {
        let api = &self.rt().api;
        let mut native = buffer.0.lock();
        native.destroy_tuple(api);
        if !(api.lbug_query_result_has_next)(&mut native.result) {
            return Ok(None);
        }

        let mut tuple = ffi::lbug_flat_tuple::empty();
        let state = (api.lbug_query_result_get_next)(&mut native.result, &mut tuple);
        if state != ffi::lbug_state::LbugSuccess {
            if !tuple._flat_tuple.is_null() {
                (api.lbug_flat_tuple_destroy)(&mut tuple);
            }
            return Err(EngineError::new(state as i32, "lbug_query_result_get_next failed"));
        }
        native.seq += 1;
        native.tuple = Some(tuple);
        Ok(Some(NativeRow { seq: native.seq }))
    }

    unsafe fn read_cell<'b>(
        &'b self,
        buffer: &'b NativeBuffer,
        row: &'b NativeRow,
        column: usize,
    ) -> std::result::Result<CellRef<'b>, EngineError> {
        let api = &self.rt().api;
        let mut native = buffer.0.lock();
        let tuple = native.tuple_for(row)?;
        let mut value = OwnedValue::new(api);
        check(
            (api.lbug_flat_tuple_get_value)(tuple, column as u64, &mut value.raw),
            "lbug_flat_tuple_get_value",
        )?;
        self.cell_of(&mut value)
    }

    fn dispose(&self, buffer: NativeBuffer) {
        let api = &self.rt().api;
        let mut native = buffer.0.into_inner();
        unsafe {
            native.destroy_tuple(api);
            (api.lbug_query_result_destroy)(&mut native.result);
        }
    }
}

impl Connection<NativeBackend> {
    /// Open a connection on `db`, disposing results inline.
    pub fn open(db: &Database) -> Result<Self> {
        Self::open_with(db, ReclaimMode::default())
    }

    pub fn open_with(db: &Database, mode: ReclaimMode) -> Result<Self> {
        Ok(Self::with_reclaim_mode(NativeBackend::open(db)?, mode))
    }
}
