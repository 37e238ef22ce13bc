//! C ABI for units shipped as shared libraries.
//!
//! A library exports `visual_unit_entry`, which returns a pointer to a static
//! [`UnitVTable`]. The host creates one instance per loaded unit and replays
//! the primitives the instance emits during `paint` onto the frame surface.
//! Rust effects can be exported with [`export_visual_unit!`](crate::export_visual_unit).
//!
//! Every load maps a fresh copy of the library file, so a rebuilt library at
//! the same path is really re-mapped instead of returning the cached handle
//! of the previous version.

use std::ffi::{c_char, c_void, CStr, CString};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use libloading::{Library, Symbol};

use crate::unit::{FrameInput, RasterEffect, SchemaField, VisualUnit};
use crate::{AudioSnapshot, Color, ConfigMap, DrawCommand, Point, Rect, Result, Surface, VisualError};

pub const ABI_VERSION: u32 = 1;
pub const ENTRY_SYMBOL: &[u8] = b"visual_unit_entry\0";

pub const COMMAND_CLEAR: u32 = 0;
pub const COMMAND_FILL_RECT: u32 = 1;
pub const COMMAND_FILL_ELLIPSE: u32 = 2;
pub const COMMAND_STROKE_LINE: u32 = 3;

static NEXT_COPY: AtomicU64 = AtomicU64::new(0);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub phase: f32,
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
    pub background_visible: bool,
}

/// One primitive crossing the ABI. `values` holds, by kind:
/// rect `x y w h`, ellipse `cx cy rx ry`, line `x1 y1 x2 y2 width`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawCommand {
    pub kind: u32,
    pub color: [u8; 4],
    pub opacity: f32,
    pub values: [f32; 5],
}

impl RawCommand {
    fn new(kind: u32, color: Color, opacity: f32, values: [f32; 5]) -> Self {
        Self {
            kind,
            color: [color.r, color.g, color.b, color.a],
            opacity,
            values,
        }
    }

    fn to_command(self) -> Option<DrawCommand> {
        let [r, g, b, a] = self.color;
        let color = Color::rgba(r, g, b, a);
        let [v0, v1, v2, v3, v4] = self.values;
        let opacity = self.opacity;
        match self.kind {
            COMMAND_CLEAR => Some(DrawCommand::Clear { color }),
            COMMAND_FILL_RECT => Some(DrawCommand::FillRect {
                rect: Rect::new(v0, v1, v2, v3),
                color,
                opacity,
            }),
            COMMAND_FILL_ELLIPSE => Some(DrawCommand::FillEllipse {
                center: Point::new(v0, v1),
                radius_x: v2,
                radius_y: v3,
                color,
                opacity,
            }),
            COMMAND_STROKE_LINE => Some(DrawCommand::StrokeLine {
                from: Point::new(v0, v1),
                to: Point::new(v2, v3),
                width: v4,
                color,
                opacity,
            }),
            _ => None,
        }
    }
}

pub type EmitFn = unsafe extern "C" fn(sink: *mut c_void, command: *const RawCommand);

/// Function table a library hands to the host.
///
/// `configure` receives the configuration as a NUL-terminated JSON object.
/// `schema` returns a JSON array of schema fields owned by the instance, or
/// null. `paint` returns `0` on success.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UnitVTable {
    pub abi_version: u32,
    pub name: *const c_char,
    pub create: unsafe extern "C" fn() -> *mut c_void,
    pub destroy: unsafe extern "C" fn(instance: *mut c_void),
    pub configure: unsafe extern "C" fn(instance: *mut c_void, config_json: *const c_char),
    pub schema: unsafe extern "C" fn(instance: *mut c_void) -> *const c_char,
    pub paint: unsafe extern "C" fn(
        instance: *mut c_void,
        frame: *const RawFrame,
        sink: *mut c_void,
        emit: EmitFn,
    ) -> i32,
}

// SAFETY: a vtable is immutable after construction and `name` points at a
// static string.
unsafe impl Send for UnitVTable {}
unsafe impl Sync for UnitVTable {}

pub type EntryFn = unsafe extern "C" fn() -> *const UnitVTable;

/// A mapped unit library.
pub struct NativeLibrary {
    vtable: UnitVTable,
    name: Option<String>,
    library: Option<Library>,
    copy: Option<PathBuf>,
}

impl NativeLibrary {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let copy = shadow_copy(path)?;
        let library = match unsafe { Library::new(&copy) } {
            Ok(library) => library,
            Err(err) => {
                let _ = fs::remove_file(&copy);
                return Err(VisualError::load(path, err.to_string()));
            }
        };

        let resolved = unsafe {
            library.get(ENTRY_SYMBOL).map(|entry: Symbol<EntryFn>| {
                let raw = entry();
                if raw.is_null() {
                    None
                } else {
                    Some(*raw)
                }
            })
        };

        let reason = match resolved {
            Ok(Some(vtable)) => {
                return Self::from_parts(vtable, Some(library), Some(copy), path).map(Arc::new);
            }
            Ok(None) => "entry point returned null".to_string(),
            Err(err) => format!("missing entry point: {err}"),
        };
        drop(library);
        let _ = fs::remove_file(&copy);
        Err(VisualError::load(path, reason))
    }

    #[cfg(test)]
    pub(crate) fn from_static(vtable: &'static UnitVTable) -> Result<Arc<Self>> {
        Self::from_parts(*vtable, None, None, Path::new("<static>")).map(Arc::new)
    }

    fn from_parts(
        vtable: UnitVTable,
        library: Option<Library>,
        copy: Option<PathBuf>,
        path: &Path,
    ) -> Result<Self> {
        let mut loaded = Self {
            vtable,
            name: None,
            library,
            copy,
        };

        if loaded.vtable.abi_version != ABI_VERSION {
            return Err(VisualError::load(
                path,
                format!(
                    "ABI version {} is not supported (expected {ABI_VERSION})",
                    loaded.vtable.abi_version
                ),
            ));
        }

        if !loaded.vtable.name.is_null() {
            let name = unsafe { CStr::from_ptr(loaded.vtable.name) };
            loaded.name = name
                .to_str()
                .ok()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string);
        }

        Ok(loaded)
    }

    pub fn declared_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        drop(self.library.take());
        if let Some(copy) = self.copy.take() {
            if let Err(err) = fs::remove_file(&copy) {
                tracing::debug!(path = %copy.display(), %err, "could not remove library copy");
            }
        }
    }
}

fn shadow_copy(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| VisualError::load(path, "not a file"))?;
    let dir = std::env::temp_dir().join("visual-runtime");
    fs::create_dir_all(&dir)?;

    let copy = dir.join(format!(
        "{}-{}-{}",
        std::process::id(),
        NEXT_COPY.fetch_add(1, Ordering::Relaxed),
        file_name.to_string_lossy()
    ));
    fs::copy(path, &copy)?;
    Ok(copy)
}

/// [`VisualUnit`] backed by an instance living inside a [`NativeLibrary`].
pub struct NativeUnit {
    identity: String,
    instance: *mut c_void,
    schema: Vec<SchemaField>,
    background_visible: bool,
    commands: Vec<RawCommand>,
    library: Arc<NativeLibrary>,
}

// SAFETY: the instance is only handed to the library through `&mut self`,
// so it is never used from two threads at once.
unsafe impl Send for NativeUnit {}

impl NativeUnit {
    pub fn new(identity: impl Into<String>, library: Arc<NativeLibrary>) -> Result<Self> {
        let identity = identity.into();
        let instance = unsafe { (library.vtable.create)() };
        if instance.is_null() {
            return Err(VisualError::msg(format!("`{identity}` failed to create an instance")));
        }

        let mut unit = Self {
            identity,
            instance,
            schema: Vec::new(),
            background_visible: true,
            commands: Vec::new(),
            library,
        };
        unit.schema = unit.read_schema();
        Ok(unit)
    }

    fn read_schema(&self) -> Vec<SchemaField> {
        let raw = unsafe { (self.library.vtable.schema)(self.instance) };
        if raw.is_null() {
            return Vec::new();
        }
        let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy();
        match serde_json::from_str(&text) {
            Ok(fields) => fields,
            Err(err) => {
                tracing::warn!(unit = %self.identity, %err, "ignoring malformed schema");
                Vec::new()
            }
        }
    }
}

impl Drop for NativeUnit {
    fn drop(&mut self) {
        unsafe { (self.library.vtable.destroy)(self.instance) };
    }
}

unsafe extern "C" fn collect_command(sink: *mut c_void, command: *const RawCommand) {
    if sink.is_null() || command.is_null() {
        return;
    }
    let commands = unsafe { &mut *sink.cast::<Vec<RawCommand>>() };
    commands.push(unsafe { *command });
}

impl VisualUnit for NativeUnit {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn configure(&mut self, config: &ConfigMap) {
        let Ok(json) = serde_json::to_string(config) else {
            return;
        };
        let Ok(json) = CString::new(json) else {
            return;
        };
        unsafe { (self.library.vtable.configure)(self.instance, json.as_ptr()) };
    }

    fn draw(&mut self, surface: &mut dyn Surface, frame: &FrameInput) -> Result<()> {
        let raw = RawFrame {
            width: frame.width,
            height: frame.height,
            phase: frame.phase,
            bass: frame.audio.bass,
            mid: frame.audio.mid,
            treble: frame.audio.treble,
            background_visible: self.background_visible,
        };

        self.commands.clear();
        let sink: *mut Vec<RawCommand> = &mut self.commands;
        let status =
            unsafe { (self.library.vtable.paint)(self.instance, &raw, sink.cast(), collect_command) };
        if status != 0 {
            return Err(VisualError::draw(
                &self.identity,
                format!("paint returned status {status}"),
            ));
        }

        for command in &self.commands {
            match command.to_command() {
                Some(command) => surface.apply(&command),
                None => tracing::debug!(unit = %self.identity, kind = command.kind, "unknown command"),
            }
        }
        Ok(())
    }

    fn config_schema(&self) -> Vec<SchemaField> {
        self.schema.clone()
    }

    fn background_visible(&self) -> bool {
        self.background_visible
    }

    fn set_background_visible(&mut self, visible: bool) {
        self.background_visible = visible;
    }
}

/// Surface an exported effect paints on; every primitive is forwarded to the
/// host through the emit callback.
pub struct EmitSurface {
    sink: *mut c_void,
    emit: EmitFn,
    width: u32,
    height: u32,
    opacity: f32,
}

impl EmitSurface {
    fn send(&mut self, command: RawCommand) {
        unsafe { (self.emit)(self.sink, &command) };
    }
}

impl Surface for EmitSurface {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn set_opacity(&mut self, opacity: f32) {
        self.opacity = opacity.clamp(0.0, 1.0);
    }

    fn opacity(&self) -> f32 {
        self.opacity
    }

    fn clear(&mut self, color: Color) {
        self.send(RawCommand::new(COMMAND_CLEAR, color, 1.0, [0.0; 5]));
    }

    fn fill_rect(&mut self, rect: Rect, color: Color) {
        let values = [rect.x, rect.y, rect.width, rect.height, 0.0];
        self.send(RawCommand::new(COMMAND_FILL_RECT, color, self.opacity, values));
    }

    fn fill_ellipse(&mut self, center: Point, radius_x: f32, radius_y: f32, color: Color) {
        let values = [center.x, center.y, radius_x, radius_y, 0.0];
        self.send(RawCommand::new(COMMAND_FILL_ELLIPSE, color, self.opacity, values));
    }

    fn stroke_line(&mut self, from: Point, to: Point, width: f32, color: Color) {
        let values = [from.x, from.y, to.x, to.y, width];
        self.send(RawCommand::new(COMMAND_STROKE_LINE, color, self.opacity, values));
    }
}

#[doc(hidden)]
pub struct Exported<E> {
    effect: E,
    schema_json: CString,
}

/// Builds the vtable exporting `E`. `name` must end with a NUL byte.
pub const fn vtable_for<E: RasterEffect + Default>(name: &'static str) -> UnitVTable {
    UnitVTable {
        abi_version: ABI_VERSION,
        name: name.as_ptr().cast(),
        create: export_create::<E>,
        destroy: export_destroy::<E>,
        configure: export_configure::<E>,
        schema: export_schema::<E>,
        paint: export_paint::<E>,
    }
}

unsafe extern "C" fn export_create<E: RasterEffect + Default>() -> *mut c_void {
    let created = panic::catch_unwind(|| {
        let effect = E::default();
        let schema = serde_json::to_string(&effect.schema()).unwrap_or_else(|_| "[]".to_string());
        Box::new(Exported {
            effect,
            schema_json: CString::new(schema).unwrap_or_default(),
        })
    });
    match created {
        Ok(exported) => Box::into_raw(exported).cast(),
        Err(_) => ptr::null_mut(),
    }
}

unsafe extern "C" fn export_destroy<E: RasterEffect + Default>(instance: *mut c_void) {
    if !instance.is_null() {
        drop(unsafe { Box::from_raw(instance.cast::<Exported<E>>()) });
    }
}

unsafe extern "C" fn export_configure<E: RasterEffect + Default>(
    instance: *mut c_void,
    config_json: *const c_char,
) {
    if instance.is_null() || config_json.is_null() {
        return;
    }
    let exported = unsafe { &mut *instance.cast::<Exported<E>>() };
    let text = unsafe { CStr::from_ptr(config_json) }.to_string_lossy();
    if let Ok(serde_json::Value::Object(config)) = serde_json::from_str(&text) {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| exported.effect.configure(&config)));
    }
}

unsafe extern "C" fn export_schema<E: RasterEffect + Default>(instance: *mut c_void) -> *const c_char {
    if instance.is_null() {
        return ptr::null();
    }
    let exported = unsafe { &*instance.cast::<Exported<E>>() };
    exported.schema_json.as_ptr()
}

unsafe extern "C" fn export_paint<E: RasterEffect + Default>(
    instance: *mut c_void,
    frame: *const RawFrame,
    sink: *mut c_void,
    emit: EmitFn,
) -> i32 {
    if instance.is_null() || frame.is_null() {
        return -1;
    }
    let exported = unsafe { &mut *instance.cast::<Exported<E>>() };
    let raw = unsafe { *frame };
    let input = FrameInput {
        width: raw.width,
        height: raw.height,
        phase: raw.phase,
        audio: AudioSnapshot::new(raw.bass, raw.mid, raw.treble),
    };
    let mut surface = EmitSurface {
        sink,
        emit,
        width: raw.width,
        height: raw.height,
        opacity: 1.0,
    };

    let painted = panic::catch_unwind(AssertUnwindSafe(|| {
        exported
            .effect
            .paint(&mut surface, &input, raw.background_visible)
    }));
    match painted {
        Ok(Ok(())) => 0,
        Ok(Err(_)) => 1,
        Err(_) => 2,
    }
}

/// Exports a [`RasterEffect`] + `Default` type as the library's unit.
///
/// ```ignore
/// visual_runtime_core::export_visual_unit!("starfield", Starfield);
/// ```
#[macro_export]
macro_rules! export_visual_unit {
    ($name:literal, $effect:ty) => {
        #[no_mangle]
        pub extern "C" fn visual_unit_entry() -> *const $crate::plugin::native::UnitVTable {
            static VTABLE: $crate::plugin::native::UnitVTable =
                $crate::plugin::native::vtable_for::<$effect>(concat!($name, "\0"));
            &VTABLE
        }
    };
}
