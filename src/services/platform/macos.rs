//! Native backend: the Accessibility tree through AXUIElement, synthetic
//! input through Quartz events, marker positions through the status item
//! preferred-position defaults of our own agent.

use super::r#trait::{AccessibilityBackend, InputSynthesizer};
use crate::config::Config;
use crate::debug_if_enabled;
use crate::error::Result;
use crate::events::boundary::is_ordinal;
use crate::events::{
    BoundaryMarker, BoundaryPositions, BoundarySnapshot, ElementRef, ItemFrame, MarkerKind, Modifier, Point,
    ProcessInfo, RawElement, SyntheticEvent,
};
use crate::tray_error;
use objc2::rc::autoreleasepool;
use objc2_app_kit::NSWorkspace;
use objc2_core_foundation::{CFRetained, CFString, CGPoint, CGRect, CGSize};
use objc2_core_graphics::{CGEvent, CGEventFlags, CGEventTapLocation, CGEventType, CGMouseButton};
use parking_lot::Mutex;
use std::ffi::{c_char, c_void};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

type CFTypeRef = *const c_void;

const AX_SUCCESS: i32 = 0;
const AX_ERROR_INVALID_ELEMENT: i32 = -25202;
const AX_ERROR_ATTRIBUTE_UNSUPPORTED: i32 = -25205;
const AX_ERROR_CANNOT_COMPLETE: i32 = -25204;
const AX_ERROR_API_DISABLED: i32 = -25211;
const AX_ERROR_NO_VALUE: i32 = -25212;

const AX_VALUE_CG_POINT: u32 = 1;
const AX_VALUE_CG_SIZE: u32 = 2;

const CF_NUMBER_FLOAT64: isize = 6;
const CF_STRING_ENCODING_UTF8: u32 = 0x0800_0100;

/// kVK_Command
const COMMAND_KEYCODE: u16 = 0x37;

const SYSTEM_UI_SERVER: &str = "com.apple.systemuiserver";

/// Accessibility-идентификаторы, которые агент выставляет своим иконкам статуса
const HIDDEN_MARKER_ID: &str = "trayzone.marker.hidden";
const ALWAYS_HIDDEN_MARKER_ID: &str = "trayzone.marker.always_hidden";
const ANCHOR_ID: &str = "trayzone.anchor";

#[link(name = "ApplicationServices", kind = "framework")]
unsafe extern "C" {
    fn AXIsProcessTrusted() -> bool;
    fn AXUIElementCreateApplication(pid: i32) -> CFTypeRef;
    fn AXUIElementCopyAttributeValue(element: CFTypeRef, attribute: CFTypeRef, value: *mut CFTypeRef) -> i32;
    fn AXUIElementGetPid(element: CFTypeRef, pid: *mut i32) -> i32;
    fn AXValueGetValue(value: CFTypeRef, value_type: u32, value_ptr: *mut c_void) -> bool;
}

#[link(name = "CoreGraphics", kind = "framework")]
unsafe extern "C" {
    fn CGMainDisplayID() -> u32;
    fn CGDisplayBounds(display: u32) -> CGRect;
    fn CGDisplayHideCursor(display: u32) -> i32;
    fn CGDisplayShowCursor(display: u32) -> i32;
}

#[link(name = "CoreFoundation", kind = "framework")]
unsafe extern "C" {
    fn CFRetain(cf: CFTypeRef) -> CFTypeRef;
    fn CFRelease(cf: CFTypeRef);
    fn CFEqual(a: CFTypeRef, b: CFTypeRef) -> bool;
    fn CFGetTypeID(cf: CFTypeRef) -> usize;
    fn CFStringGetTypeID() -> usize;
    fn CFStringGetCString(string: CFTypeRef, buffer: *mut c_char, size: isize, encoding: u32) -> bool;
    fn CFArrayGetCount(array: CFTypeRef) -> isize;
    fn CFArrayGetValueAtIndex(array: CFTypeRef, index: isize) -> CFTypeRef;
    fn CFNumberCreate(allocator: CFTypeRef, number_type: isize, value: *const c_void) -> CFTypeRef;
    fn CFPreferencesSetAppValue(key: CFTypeRef, value: CFTypeRef, application: CFTypeRef);
    fn CFPreferencesAppSynchronize(application: CFTypeRef) -> bool;
}

/// Владеющая ссылка на CF-объект, освобождается при drop
struct CfOwned(NonNull<c_void>);

// AXUIElement и неизменяемые CF-объекты можно читать из любого потока
unsafe impl Send for CfOwned {}
unsafe impl Sync for CfOwned {}

impl CfOwned {
    /// Забрать объект из Create/Copy-функции
    fn from_create(raw: CFTypeRef) -> Option<Self> {
        NonNull::new(raw as *mut c_void).map(Self)
    }

    /// Удержать объект, полученный по Get-правилу
    fn retain(raw: CFTypeRef) -> Option<Self> {
        let raw = NonNull::new(raw as *mut c_void)?;
        unsafe { CFRetain(raw.as_ptr()) };
        Some(Self(raw))
    }

    fn as_ptr(&self) -> CFTypeRef {
        self.0.as_ptr()
    }
}

impl Drop for CfOwned {
    fn drop(&mut self) {
        unsafe { CFRelease(self.0.as_ptr()) };
    }
}

fn cf_str(value: &str) -> CFRetained<CFString> {
    CFString::from_str(value)
}

fn cf_ptr(string: &CFString) -> CFTypeRef {
    (string as *const CFString).cast()
}

fn string_value(value: &CfOwned) -> Option<String> {
    unsafe {
        if CFGetTypeID(value.as_ptr()) != CFStringGetTypeID() {
            return None;
        }
        let mut buffer: Vec<c_char> = vec![0; 512];
        if !CFStringGetCString(
            value.as_ptr(),
            buffer.as_mut_ptr(),
            buffer.len() as isize,
            CF_STRING_ENCODING_UTF8,
        ) {
            return None;
        }
        let bytes: Vec<u8> = buffer.iter().take_while(|b| **b != 0).map(|b| *b as u8).collect();
        String::from_utf8(bytes).ok()
    }
}

/// Результат чтения атрибута: ошибки "нет значения" не считаются сбоем
fn copy_attribute(element: &CfOwned, attribute: &str) -> Result<Option<CfOwned>> {
    let name = cf_str(attribute);
    let mut value: CFTypeRef = ptr::null();
    let code = unsafe { AXUIElementCopyAttributeValue(element.as_ptr(), cf_ptr(&name), &mut value) };
    match code {
        AX_SUCCESS => Ok(CfOwned::from_create(value)),
        AX_ERROR_NO_VALUE | AX_ERROR_ATTRIBUTE_UNSUPPORTED => Ok(None),
        AX_ERROR_API_DISABLED => Err(tray_error!(permission, "Accessibility API отключён ({})", attribute)),
        AX_ERROR_INVALID_ELEMENT => Err(tray_error!(item_not_found, "элемент исчез при чтении {}", attribute)),
        AX_ERROR_CANNOT_COMPLETE => Err(tray_error!(timeout, "процесс не ответил на чтение {}", attribute)),
        code => Err(tray_error!(internal, "AXError {} при чтении {}", code, attribute)),
    }
}

fn children(element: &CfOwned) -> Result<Vec<CfOwned>> {
    let Some(array) = copy_attribute(element, "AXChildren")? else {
        return Ok(Vec::new());
    };
    let count = unsafe { CFArrayGetCount(array.as_ptr()) };
    Ok((0..count)
        .filter_map(|index| CfOwned::retain(unsafe { CFArrayGetValueAtIndex(array.as_ptr(), index) }))
        .collect())
}

fn ax_value<T>(element: &CfOwned, attribute: &str, value_type: u32, mut out: T) -> Result<Option<T>> {
    let Some(value) = copy_attribute(element, attribute)? else {
        return Ok(None);
    };
    let ok = unsafe { AXValueGetValue(value.as_ptr(), value_type, (&mut out as *mut T).cast()) };
    Ok(ok.then_some(out))
}

fn frame_of(element: &CfOwned) -> Result<Option<ItemFrame>> {
    let position = ax_value(element, "AXPosition", AX_VALUE_CG_POINT, CGPoint::new(0.0, 0.0))?;
    let size = ax_value(element, "AXSize", AX_VALUE_CG_SIZE, CGSize::new(0.0, 0.0))?;
    Ok(position
        .zip(size)
        .map(|(p, s)| ItemFrame::new(p.x, p.y, s.width, s.height)))
}

fn string_attribute(element: &CfOwned, attribute: &str) -> Option<String> {
    copy_attribute(element, attribute)
        .ok()
        .flatten()
        .and_then(|value| string_value(&value))
        .filter(|value| !value.is_empty())
}

fn pid_of(element: &CfOwned) -> Option<i32> {
    let mut pid = 0;
    (unsafe { AXUIElementGetPid(element.as_ptr(), &mut pid) } == AX_SUCCESS).then_some(pid)
}

/// Строка меню macOS: дерево Accessibility и синтез событий Quartz.
/// Ссылки на элементы выдаются реестром и живут, пока жив бэкенд.
pub struct MacMenuBar {
    own_bundle_id: String,
    elements: Mutex<Vec<(ElementRef, CfOwned)>>,
    next_element: AtomicU64,
    modifier_down: AtomicBool,
}

impl MacMenuBar {
    pub fn new(config: &Config) -> Result<Self> {
        info!("Нативный бэкенд строки меню macOS (агент {})", config.scan.own_bundle_id);
        Ok(Self {
            own_bundle_id: config.scan.own_bundle_id.clone(),
            elements: Mutex::new(Vec::new()),
            next_element: AtomicU64::new(1),
            modifier_down: AtomicBool::new(false),
        })
    }

    fn register(&self, element: CfOwned) -> ElementRef {
        let mut elements = self.elements.lock();
        if let Some((existing, _)) = elements
            .iter()
            .find(|(_, known)| unsafe { CFEqual(known.as_ptr(), element.as_ptr()) })
        {
            return *existing;
        }
        let reference = ElementRef(self.next_element.fetch_add(1, Ordering::Relaxed));
        elements.push((reference, element));
        reference
    }

    fn with_element<T>(&self, element: ElementRef, read: impl FnOnce(&CfOwned) -> Result<T>) -> Result<T> {
        let elements = self.elements.lock();
        let (_, found) = elements
            .iter()
            .find(|(reference, _)| *reference == element)
            .ok_or_else(|| tray_error!(item_not_found, "элемент {:?} не регистрировался", element))?;
        read(found)
    }

    fn application(pid: i32) -> Result<CfOwned> {
        CfOwned::from_create(unsafe { AXUIElementCreateApplication(pid) })
            .ok_or_else(|| tray_error!(internal, "AXUIElementCreateApplication({}) вернул NULL", pid))
    }

    fn extras_of(pid: i32) -> Result<Option<CfOwned>> {
        copy_attribute(&Self::application(pid)?, "AXExtrasMenuBar")
    }

    fn raw_element(&self, element: CfOwned) -> RawElement {
        let identifier = string_attribute(&element, "AXIdentifier");
        let label = string_attribute(&element, "AXDescription").or_else(|| string_attribute(&element, "AXTitle"));
        let frame = frame_of(&element).ok().flatten();
        RawElement {
            element: self.register(element),
            identifier,
            label,
            frame,
        }
    }

    fn pid_for(&self, bundle_id: &str) -> Result<Option<i32>> {
        Ok(self
            .running_processes()?
            .into_iter()
            .find(|process| process.bundle_id == bundle_id)
            .map(|process| process.pid))
    }

    fn post_cg(&self, event: &CGEvent) {
        unsafe { CGEvent::post(CGEventTapLocation::HIDEventTap, Some(event)) };
    }

    fn flags(&self) -> CGEventFlags {
        if self.modifier_down.load(Ordering::Acquire) {
            CGEventFlags::MaskCommand
        } else {
            CGEventFlags(0)
        }
    }
}

impl AccessibilityBackend for MacMenuBar {
    fn is_trusted(&self) -> bool {
        unsafe { AXIsProcessTrusted() }
    }

    #[allow(unused_unsafe)]
    fn running_processes(&self) -> Result<Vec<ProcessInfo>> {
        let processes = autoreleasepool(|_| unsafe {
            let workspace = NSWorkspace::sharedWorkspace();
            workspace
                .runningApplications()
                .iter()
                .filter_map(|app| {
                    let bundle_id = app.bundleIdentifier()?.to_string();
                    Some(ProcessInfo::new(app.processIdentifier(), bundle_id))
                })
                .collect::<Vec<_>>()
        });
        debug_if_enabled!("NSWorkspace: {} процессов с bundle id", processes.len());
        Ok(processes)
    }

    fn extras_children(&self, process: &ProcessInfo) -> Result<Option<Vec<RawElement>>> {
        let Some(extras) = Self::extras_of(process.pid)? else {
            return Ok(None);
        };
        Ok(Some(
            children(&extras)?
                .into_iter()
                .map(|child| self.raw_element(child))
                .collect(),
        ))
    }

    fn system_menu_bar_children(&self, process: &ProcessInfo) -> Result<Vec<RawElement>> {
        // Системные иконки живут в строке SystemUIServer, владелец определяется по pid элемента
        let Some(server) = self.pid_for(SYSTEM_UI_SERVER)? else {
            return Ok(Vec::new());
        };
        let Some(extras) = Self::extras_of(server)? else {
            return Ok(Vec::new());
        };
        Ok(children(&extras)?
            .into_iter()
            .filter(|child| pid_of(child) == Some(process.pid))
            .map(|child| self.raw_element(child))
            .collect())
    }

    fn item_frame(&self, element: ElementRef) -> Result<Option<ItemFrame>> {
        self.with_element(element, frame_of)
    }

    fn marker_snapshot(&self) -> Result<BoundarySnapshot> {
        let mut snapshot = BoundarySnapshot::default();
        let Some(pid) = self.pid_for(&self.own_bundle_id)? else {
            warn!("Агент {} не запущен, маркеры недоступны", self.own_bundle_id);
            return Ok(snapshot);
        };
        let Some(extras) = Self::extras_of(pid)? else {
            return Ok(snapshot);
        };
        for child in children(&extras)? {
            let Some(x) = frame_of(&child)?.map(|frame| frame.x) else {
                continue;
            };
            match string_attribute(&child, "AXIdentifier").as_deref() {
                Some(HIDDEN_MARKER_ID) => snapshot.hidden = Some(BoundaryMarker::new(MarkerKind::Hidden, x)),
                Some(ALWAYS_HIDDEN_MARKER_ID) => {
                    snapshot.always_hidden = Some(BoundaryMarker::new(MarkerKind::AlwaysHidden, x))
                }
                Some(ANCHOR_ID) => snapshot.anchor_x = Some(x),
                _ => {}
            }
        }
        Ok(snapshot)
    }

    /// Позиции пишутся в defaults агента как "NSStatusItem Preferred Position",
    /// которое система отсчитывает от правого края экрана. Агент подхватывает
    /// их при следующей раскладке своих иконок.
    fn place_markers(&self, positions: &BoundaryPositions) -> Result<()> {
        let screen_width = self.screen_width();
        let application = cf_str(&self.own_bundle_id);
        let preferred = |x: f64| if is_ordinal(x) { x } else { screen_width - x };

        let entries = [
            (HIDDEN_MARKER_ID, Some(positions.hidden_x)),
            (ALWAYS_HIDDEN_MARKER_ID, positions.always_hidden_x),
        ];
        for (autosave, x) in entries {
            let Some(x) = x.filter(|x| x.is_finite()) else {
                continue;
            };
            let value = preferred(x);
            let key = cf_str(&format!("NSStatusItem Preferred Position {}", autosave));
            let number = CfOwned::from_create(unsafe {
                CFNumberCreate(ptr::null(), CF_NUMBER_FLOAT64, (&value as *const f64).cast())
            })
            .ok_or_else(|| tray_error!(internal, "CFNumberCreate вернул NULL"))?;
            unsafe { CFPreferencesSetAppValue(cf_ptr(&key), number.as_ptr(), cf_ptr(&application)) };
            debug_if_enabled!("{} = {:.1} (x={:.1})", autosave, value, x);
        }

        if unsafe { CFPreferencesAppSynchronize(cf_ptr(&application)) } {
            Ok(())
        } else {
            Err(tray_error!(
                service_unavailable,
                "не удалось записать позиции маркеров в defaults {}",
                self.own_bundle_id
            ))
        }
    }

    fn screen_width(&self) -> f64 {
        unsafe { CGDisplayBounds(CGMainDisplayID()).size.width }
    }
}

impl InputSynthesizer for MacMenuBar {
    #[allow(unused_unsafe)]
    fn post(&self, event: SyntheticEvent) -> Result<()> {
        let (mouse_type, point) = match event {
            SyntheticEvent::MouseMoved(p) => (CGEventType::MouseMoved, p),
            SyntheticEvent::MouseDragged(p) => (CGEventType::LeftMouseDragged, p),
            SyntheticEvent::MouseDown(p) => (CGEventType::LeftMouseDown, p),
            SyntheticEvent::MouseUp(p) => (CGEventType::LeftMouseUp, p),
            SyntheticEvent::ModifierDown(Modifier::Command) | SyntheticEvent::ModifierUp(Modifier::Command) => {
                let down = matches!(event, SyntheticEvent::ModifierDown(_));
                self.modifier_down.store(down, Ordering::Release);
                let key = unsafe { CGEvent::new_keyboard_event(None, COMMAND_KEYCODE, down) }
                    .ok_or_else(|| tray_error!(internal, "CGEventCreateKeyboardEvent вернул NULL"))?;
                unsafe { CGEvent::set_flags(Some(&*key), self.flags()) };
                self.post_cg(&key);
                return Ok(());
            }
        };

        let mouse = unsafe {
            CGEvent::new_mouse_event(None, mouse_type, CGPoint::new(point.x, point.y), CGMouseButton::Left)
        }
        .ok_or_else(|| tray_error!(internal, "CGEventCreateMouseEvent вернул NULL"))?;
        unsafe { CGEvent::set_flags(Some(&*mouse), self.flags()) };
        self.post_cg(&mouse);
        Ok(())
    }

    #[allow(unused_unsafe)]
    fn cursor_position(&self) -> Result<Point> {
        let event = unsafe { CGEvent::new(None) }
            .ok_or_else(|| tray_error!(internal, "CGEventCreate вернул NULL"))?;
        let location = unsafe { CGEvent::location(Some(&*event)) };
        Ok(Point::new(location.x, location.y))
    }

    fn set_cursor_visible(&self, visible: bool) -> Result<()> {
        let code = unsafe {
            let display = CGMainDisplayID();
            if visible {
                CGDisplayShowCursor(display)
            } else {
                CGDisplayHideCursor(display)
            }
        };
        if code == 0 {
            Ok(())
        } else {
            Err(tray_error!(internal, "CGError {} при смене видимости курсора", code))
        }
    }
}
