use super::r#trait::{AccessibilityBackend, InputSynthesizer};
use crate::config::Config;
use crate::debug_if_enabled;
use crate::error::Result;
use crate::events::boundary::{is_ordinal, BLOCKING_SENTINEL};
use crate::events::{
    BoundaryMarker, BoundaryPositions, BoundarySnapshot, ElementRef, ItemFrame, MarkerKind, Modifier, Point,
    ProcessInfo, RawElement, SyntheticEvent, Zone,
};
use crate::tray_error;
use parking_lot::Mutex;
use tracing::info;

const BAR_HEIGHT: f64 = 24.0;
const MARKER_WIDTH: f64 = 8.0;
const ANCHOR_WIDTH: f64 = 22.0;
/// Ширина системной области справа (часы, Control Center)
const SYSTEM_AREA_WIDTH: f64 = 160.0;

#[derive(Debug, Clone, PartialEq)]
enum SlotKind {
    Item {
        identifier: Option<String>,
        label: Option<String>,
        geometry_available: bool,
    },
    Marker(MarkerKind),
    Anchor,
}

#[derive(Debug, Clone)]
struct Slot {
    element: ElementRef,
    pid: i32,
    kind: SlotKind,
    width: f64,
    x: f64,
}

#[derive(Debug, Clone)]
struct SimProcess {
    info: ProcessInfo,
    uses_system_menu_bar: bool,
    failing: bool,
}

#[derive(Debug)]
struct SimState {
    trusted: bool,
    screen_width: f64,
    collapsed: bool,
    /// Слоты слева направо, раскладка выровнена по правому краю
    slots: Vec<Slot>,
    processes: Vec<SimProcess>,
    next_element: u64,

    cursor: Point,
    cursor_visible: bool,
    button_down: bool,
    modifier_down: bool,
    grabbed: Option<ElementRef>,
    events: Vec<SyntheticEvent>,

    offscreen_reads: usize,
    ignore_drops: bool,
    scan_requests: usize,
    placed: Option<BoundaryPositions>,
}

impl SimState {
    fn relayout(&mut self) {
        let mut right = self.screen_width - SYSTEM_AREA_WIDTH;
        let collapsed = self.collapsed;
        for slot in self.slots.iter_mut().rev() {
            let width = match slot.kind {
                SlotKind::Marker(MarkerKind::Hidden) if collapsed => BLOCKING_SENTINEL,
                _ => slot.width,
            };
            right -= width;
            slot.x = right;
        }
    }

    fn slot(&self, element: ElementRef) -> Option<&Slot> {
        self.slots.iter().find(|slot| slot.element == element)
    }

    fn position_of(&self, kind: &SlotKind) -> Option<usize> {
        self.slots.iter().position(|slot| &slot.kind == kind)
    }

    fn raw_elements(&self, pid: i32) -> Vec<RawElement> {
        self.slots
            .iter()
            .filter(|slot| slot.pid == pid)
            .filter_map(|slot| match &slot.kind {
                SlotKind::Item {
                    identifier,
                    label,
                    geometry_available,
                } => Some(RawElement {
                    element: slot.element,
                    identifier: identifier.clone(),
                    label: label.clone(),
                    frame: geometry_available
                        .then(|| ItemFrame::new(slot.x, 0.0, slot.width, BAR_HEIGHT)),
                }),
                _ => None,
            })
            .collect()
    }

    fn slot_at(&self, point: Point) -> Option<ElementRef> {
        self.slots
            .iter()
            .find(|slot| point.x >= slot.x && point.x < slot.x + slot.width)
            .filter(|slot| matches!(slot.kind, SlotKind::Item { .. }))
            .map(|slot| slot.element)
    }

    /// Перестановка иконки по отпусканию: вставка по центрам остальных слотов.
    /// Отпускание ровно над центром соседа ставит иконку после него.
    fn drop_grabbed(&mut self, point: Point) {
        let Some(element) = self.grabbed.take() else {
            return;
        };
        if self.ignore_drops || !self.modifier_down {
            debug_if_enabled!("Симулятор: drop {:?} проигнорирован", element);
            return;
        }
        let Some(from) = self.slots.iter().position(|slot| slot.element == element) else {
            return;
        };
        let index = self
            .slots
            .iter()
            .filter(|slot| slot.element != element)
            .filter(|slot| slot.x + slot.width / 2.0 <= point.x)
            .count();
        let slot = self.slots.remove(from);
        self.slots.insert(index, slot);
        self.relayout();
    }

    /// Перенести маркер так, чтобы он встал в точке `x`, не нарушая порядок
    /// always_hidden < hidden < якорь
    fn place_marker(&mut self, kind: MarkerKind, x: f64) {
        let Some(from) = self.position_of(&SlotKind::Marker(kind)) else {
            return;
        };
        let slot = self.slots.remove(from);
        let wanted = self
            .slots
            .iter()
            .filter(|other| other.x + other.width / 2.0 < x)
            .count();
        let (low, high) = match kind {
            MarkerKind::Hidden => (
                self.position_of(&SlotKind::Marker(MarkerKind::AlwaysHidden))
                    .map_or(0, |i| i + 1),
                self.position_of(&SlotKind::Anchor).unwrap_or(self.slots.len()),
            ),
            MarkerKind::AlwaysHidden => (
                0,
                self.position_of(&SlotKind::Marker(MarkerKind::Hidden))
                    .unwrap_or(self.slots.len()),
            ),
        };
        self.slots.insert(wanted.clamp(low, high.max(low)), slot);
        self.relayout();
    }
}

/// In-memory модель строки меню: одновременно дерево Accessibility и
/// получатель синтетического ввода. Используется в `--dry-run` и в тестах.
#[derive(Debug)]
pub struct SimulatedMenuBar {
    state: Mutex<SimState>,
    own_pid: i32,
}

impl SimulatedMenuBar {
    pub fn new(screen_width: f64, own_pid: i32) -> Self {
        let mut state = SimState {
            trusted: true,
            screen_width,
            collapsed: false,
            slots: Vec::new(),
            processes: Vec::new(),
            next_element: 1,
            cursor: Point::new(screen_width / 2.0, 400.0),
            cursor_visible: true,
            button_down: false,
            modifier_down: false,
            grabbed: None,
            events: Vec::new(),
            offscreen_reads: 0,
            ignore_drops: false,
            scan_requests: 0,
            placed: None,
        };

        for (kind, width) in [
            (SlotKind::Marker(MarkerKind::AlwaysHidden), MARKER_WIDTH),
            (SlotKind::Marker(MarkerKind::Hidden), MARKER_WIDTH),
            (SlotKind::Anchor, ANCHOR_WIDTH),
        ] {
            let element = ElementRef(state.next_element);
            state.next_element += 1;
            state.slots.push(Slot {
                element,
                pid: own_pid,
                kind,
                width,
                x: 0.0,
            });
        }
        state.relayout();

        Self {
            state: Mutex::new(state),
            own_pid,
        }
    }

    /// Демонстрационная раскладка для `--dry-run`
    pub fn demo(config: &Config) -> Self {
        info!("Dry-run режим - строка меню эмулируется в памяти");
        let sim = Self::new(1512.0, 1);
        let control_center = config
            .scan
            .multiplexing_owners
            .first()
            .cloned()
            .unwrap_or_else(|| "com.apple.controlcenter".to_string());

        sim.add_process(ProcessInfo::new(100, control_center), true);
        sim.add_process(ProcessInfo::new(200, "com.example.dropbox"), false);
        sim.add_process(ProcessInfo::new(300, "com.example.vpn"), false);
        sim.add_process(ProcessInfo::new(400, "com.example.weather"), false);

        sim.add_item(100, Some("com.apple.menuextra.wifi"), Some("Wi-Fi"), 22.0, Zone::Visible);
        sim.add_item(100, Some("com.apple.menuextra.battery"), Some("Battery"), 30.0, Zone::Visible);
        sim.add_item(200, Some("com.example.dropbox.status"), Some("Dropbox"), 22.0, Zone::Visible);
        sim.add_item(300, None, Some("VPN"), 18.0, Zone::Hidden);
        sim.add_item(400, None, Some("Weather"), 48.0, Zone::Hidden);
        sim.add_item(400, None, Some("Forecast"), 22.0, Zone::AlwaysHidden);
        sim
    }

    pub fn add_process(&self, info: ProcessInfo, uses_system_menu_bar: bool) {
        self.state.lock().processes.push(SimProcess {
            info,
            uses_system_menu_bar,
            failing: false,
        });
    }

    /// Добавить иконку в правый конец секции зоны
    pub fn add_item(
        &self,
        pid: i32,
        identifier: Option<&str>,
        label: Option<&str>,
        width: f64,
        zone: Zone,
    ) -> ElementRef {
        let mut state = self.state.lock();
        let element = ElementRef(state.next_element);
        state.next_element += 1;

        let index = match zone {
            Zone::AlwaysHidden => state.position_of(&SlotKind::Marker(MarkerKind::AlwaysHidden)),
            Zone::Hidden => state.position_of(&SlotKind::Marker(MarkerKind::Hidden)),
            Zone::Visible => None,
        }
        .unwrap_or(state.slots.len());

        state.slots.insert(
            index,
            Slot {
                element,
                pid,
                kind: SlotKind::Item {
                    identifier: identifier.map(str::to_string),
                    label: label.map(str::to_string),
                    geometry_available: true,
                },
                width,
                x: 0.0,
            },
        );
        state.relayout();
        element
    }

    pub fn set_trusted(&self, trusted: bool) {
        self.state.lock().trusted = trusted;
    }

    pub fn set_process_failing(&self, pid: i32, failing: bool) {
        let mut state = self.state.lock();
        if let Some(process) = state.processes.iter_mut().find(|p| p.info.pid == pid) {
            process.failing = failing;
        }
    }

    pub fn set_geometry_available(&self, element: ElementRef, available: bool) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.iter_mut().find(|slot| slot.element == element) {
            if let SlotKind::Item { geometry_available, .. } = &mut slot.kind {
                *geometry_available = available;
            }
        }
    }

    /// Свернуть/развернуть скрытую область (маркер расширяется до sentinel)
    pub fn set_collapsed(&self, collapsed: bool) {
        let mut state = self.state.lock();
        state.collapsed = collapsed;
        state.relayout();
    }

    /// Следующие `reads` чтений геометрии вернут устаревшую off-screen позицию
    pub fn report_offscreen_for(&self, reads: usize) {
        self.state.lock().offscreen_reads = reads;
    }

    pub fn set_ignore_drops(&self, ignore: bool) {
        self.state.lock().ignore_drops = ignore;
    }

    pub fn set_screen_width(&self, width: f64) {
        let mut state = self.state.lock();
        state.screen_width = width;
        state.relayout();
    }

    pub fn frame_of(&self, element: ElementRef) -> Option<ItemFrame> {
        let state = self.state.lock();
        state
            .slot(element)
            .map(|slot| ItemFrame::new(slot.x, 0.0, slot.width, BAR_HEIGHT))
    }

    pub fn events(&self) -> Vec<SyntheticEvent> {
        self.state.lock().events.clone()
    }

    pub fn cursor(&self) -> Point {
        self.state.lock().cursor
    }

    pub fn cursor_visible(&self) -> bool {
        self.state.lock().cursor_visible
    }

    pub fn button_down(&self) -> bool {
        self.state.lock().button_down
    }

    pub fn modifier_down(&self) -> bool {
        self.state.lock().modifier_down
    }

    /// Сколько раз запрашивался список процессов (т.е. начиналось сканирование)
    pub fn scan_requests(&self) -> usize {
        self.state.lock().scan_requests
    }

    /// Последние позиции, переданные в `place_markers`
    pub fn placed_markers(&self) -> Option<BoundaryPositions> {
        self.state.lock().placed
    }
}

impl AccessibilityBackend for SimulatedMenuBar {
    fn is_trusted(&self) -> bool {
        self.state.lock().trusted
    }

    fn running_processes(&self) -> Result<Vec<ProcessInfo>> {
        let mut state = self.state.lock();
        state.scan_requests += 1;
        let mut processes: Vec<ProcessInfo> = state.processes.iter().map(|p| p.info.clone()).collect();
        processes.push(ProcessInfo::new(self.own_pid, "dev.trayzone.agent"));
        Ok(processes)
    }

    fn extras_children(&self, process: &ProcessInfo) -> Result<Option<Vec<RawElement>>> {
        let state = self.state.lock();
        let sim = state.processes.iter().find(|p| p.info.pid == process.pid);
        match sim {
            Some(sim) if sim.failing => Err(tray_error!(
                permission,
                "дерево процесса {} недоступно",
                process.bundle_id
            )),
            Some(sim) if sim.uses_system_menu_bar => Ok(None),
            Some(_) => Ok(Some(state.raw_elements(process.pid))),
            None if process.pid == self.own_pid => Ok(Some(Vec::new())),
            None => Ok(None),
        }
    }

    fn system_menu_bar_children(&self, process: &ProcessInfo) -> Result<Vec<RawElement>> {
        let state = self.state.lock();
        Ok(state.raw_elements(process.pid))
    }

    fn item_frame(&self, element: ElementRef) -> Result<Option<ItemFrame>> {
        let mut state = self.state.lock();
        let Some(slot) = state.slot(element).cloned() else {
            return Err(tray_error!(item_not_found, "элемент {:?} исчез", element));
        };
        if let SlotKind::Item { geometry_available: false, .. } = slot.kind {
            return Ok(None);
        }
        if state.offscreen_reads > 0 {
            state.offscreen_reads -= 1;
            return Ok(Some(ItemFrame::new(-BLOCKING_SENTINEL, 0.0, slot.width, BAR_HEIGHT)));
        }
        Ok(Some(ItemFrame::new(slot.x, 0.0, slot.width, BAR_HEIGHT)))
    }

    fn marker_snapshot(&self) -> Result<BoundarySnapshot> {
        let state = self.state.lock();
        let mut snapshot = BoundarySnapshot::default();
        for slot in &state.slots {
            match slot.kind {
                SlotKind::Marker(kind @ MarkerKind::Hidden) => {
                    snapshot.hidden = Some(BoundaryMarker::new(kind, slot.x));
                }
                SlotKind::Marker(kind @ MarkerKind::AlwaysHidden) => {
                    snapshot.always_hidden = Some(BoundaryMarker::new(kind, slot.x));
                }
                SlotKind::Anchor => snapshot.anchor_x = Some(slot.x),
                SlotKind::Item { .. } => {}
            }
        }
        Ok(snapshot)
    }

    fn place_markers(&self, positions: &BoundaryPositions) -> Result<()> {
        let mut state = self.state.lock();
        state.placed = Some(*positions);
        let screen_width = state.screen_width;
        let pixel = |x: f64| (x.is_finite() && !is_ordinal(x) && x < screen_width).then_some(x);

        if let Some(x) = pixel(positions.hidden_x) {
            state.place_marker(MarkerKind::Hidden, x);
        }
        if let Some(x) = positions.always_hidden_x.and_then(pixel) {
            state.place_marker(MarkerKind::AlwaysHidden, x);
        }
        debug_if_enabled!("Симулятор: маркеры выставлены в {:?}", positions);
        Ok(())
    }

    fn screen_width(&self) -> f64 {
        self.state.lock().screen_width
    }
}

impl InputSynthesizer for SimulatedMenuBar {
    fn post(&self, event: SyntheticEvent) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(event);
        match event {
            SyntheticEvent::MouseMoved(point) | SyntheticEvent::MouseDragged(point) => {
                state.cursor = point;
            }
            SyntheticEvent::MouseDown(point) => {
                state.cursor = point;
                state.button_down = true;
                state.grabbed = if state.modifier_down {
                    state.slot_at(point)
                } else {
                    None
                };
            }
            SyntheticEvent::MouseUp(point) => {
                state.cursor = point;
                state.button_down = false;
                state.drop_grabbed(point);
            }
            SyntheticEvent::ModifierDown(Modifier::Command) => state.modifier_down = true,
            SyntheticEvent::ModifierUp(Modifier::Command) => state.modifier_down = false,
        }
        Ok(())
    }

    fn cursor_position(&self) -> Result<Point> {
        Ok(self.state.lock().cursor)
    }

    fn set_cursor_visible(&self, visible: bool) -> Result<()> {
        self.state.lock().cursor_visible = visible;
        Ok(())
    }
}

/// Набор bundle id процессов симулятора
#[cfg(test)]
fn owners(sim: &SimulatedMenuBar) -> std::collections::HashSet<String> {
    sim.state
        .lock()
        .processes
        .iter()
        .map(|p| p.info.bundle_id.clone())
        .collect()
}
