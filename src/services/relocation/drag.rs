use crate::config::RelocationConfig;
use crate::{debug_if_enabled, trace_if_enabled};
use crate::error::Result;
use crate::events::{Modifier, Point, SyntheticEvent};
use crate::services::clock::Clock;
use crate::services::platform::InputSynthesizer;
use crate::tray_error;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Параметры одного жеста перетаскивания
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragPlan {
    pub grab: Point,
    pub drop: Point,
    pub modifier: Modifier,
    pub steps: u32,
    pub duration: Duration,
    pub press_hold: Duration,
    pub drop_settle: Duration,
    /// Сколько дедлайна отводится на принудительное отпускание ввода
    pub release_grace: Duration,
}

impl DragPlan {
    pub fn new(grab: Point, drop: Point, config: &RelocationConfig) -> Self {
        Self {
            grab,
            drop,
            modifier: Modifier::Command,
            steps: config.drag_steps.max(1),
            duration: config.drag_duration(),
            press_hold: config.press_hold(),
            drop_settle: config.drop_settle(),
            release_grace: config.release_grace(),
        }
    }

    fn step_interval(&self) -> Duration {
        self.duration / self.steps
    }
}

/// Что жест удерживает прямо сейчас. Намерение фиксируется до отправки
/// события, поэтому зависшая отправка MouseDown всё равно приведёт к MouseUp.
#[derive(Debug)]
struct InputHold {
    modifier: Modifier,
    restore_to: Option<Point>,
    last_position: Option<Point>,
    cursor_hidden: bool,
    modifier_down: bool,
    button_down: bool,
    released: bool,
    /// Жест брошен по дедлайну, отпусканием занимается вызывающий
    abandoned: bool,
}

impl InputHold {
    fn new(modifier: Modifier) -> Self {
        Self {
            modifier,
            restore_to: None,
            last_position: None,
            cursor_hidden: false,
            modifier_down: false,
            button_down: false,
            released: false,
            abandoned: false,
        }
    }

    fn note(&mut self, event: SyntheticEvent) {
        match event {
            SyntheticEvent::MouseMoved(p) | SyntheticEvent::MouseDragged(p) => self.last_position = Some(p),
            SyntheticEvent::MouseDown(p) => {
                self.last_position = Some(p);
                self.button_down = true;
            }
            SyntheticEvent::MouseUp(p) => {
                self.last_position = Some(p);
                self.button_down = false;
            }
            SyntheticEvent::ModifierDown(_) => self.modifier_down = true,
            SyntheticEvent::ModifierUp(_) => self.modifier_down = false,
        }
    }

    /// Однократно: второй вызов возвращает `None`
    fn take_release(&mut self) -> Option<Release> {
        if self.released {
            return None;
        }
        self.released = true;
        Some(Release {
            button_up: self.button_down.then_some(self.last_position).flatten(),
            modifier_up: self.modifier_down.then_some(self.modifier),
            show_cursor: self.cursor_hidden,
            restore_to: self.restore_to,
        })
    }
}

/// Набор событий, возвращающих ввод в исходное состояние
#[derive(Debug)]
struct Release {
    button_up: Option<Point>,
    modifier_up: Option<Modifier>,
    show_cursor: bool,
    restore_to: Option<Point>,
}

impl Release {
    fn apply(self, input: &dyn InputSynthesizer) {
        if let Some(point) = self.button_up {
            warn!("Принудительное отпускание кнопки в {}", point);
            if let Err(e) = input.post(SyntheticEvent::MouseUp(point)) {
                error!("Не удалось отправить принудительный mouse up: {}", e);
            }
        }
        if let Some(modifier) = self.modifier_up {
            if let Err(e) = input.post(SyntheticEvent::ModifierUp(modifier)) {
                error!("Не удалось отпустить модификатор: {}", e);
            }
        }
        if self.show_cursor {
            if let Err(e) = input.set_cursor_visible(true) {
                error!("Не удалось вернуть курсор: {}", e);
            }
        }
        if let Some(point) = self.restore_to {
            if let Err(e) = input.post(SyntheticEvent::MouseMoved(point)) {
                error!("Не удалось вернуть курсор в {}: {}", point, e);
            }
        }
    }
}

/// Отпускает ввод, если задача жеста упала или была отменена, не будучи брошенной
struct HoldGuard {
    input: Arc<dyn InputSynthesizer>,
    hold: Arc<Mutex<InputHold>>,
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        let release = {
            let mut hold = self.hold.lock();
            if hold.abandoned {
                None
            } else {
                hold.take_release()
            }
        };
        if let Some(release) = release {
            release.apply(self.input.as_ref());
        }
    }
}

/// Вызовы синтезатора могут блокироваться, поэтому они уходят в пул блокирующих задач
async fn blocking<T, F>(input: &Arc<dyn InputSynthesizer>, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn InputSynthesizer) -> Result<T> + Send + 'static,
{
    let input = Arc::clone(input);
    tokio::task::spawn_blocking(move || call(input.as_ref()))
        .await
        .map_err(|e| tray_error!(internal, "вызов синтезатора ввода завершился аварийно: {}", e))?
}

struct Gesture {
    input: Arc<dyn InputSynthesizer>,
    hold: Arc<Mutex<InputHold>>,
}

impl Gesture {
    async fn post(&self, event: SyntheticEvent) -> Result<()> {
        self.hold.lock().note(event);
        blocking(&self.input, move |input| input.post(event)).await
    }

    async fn hide_cursor(&self) -> Result<()> {
        self.hold.lock().cursor_hidden = true;
        blocking(&self.input, |input| input.set_cursor_visible(false)).await
    }

    /// Синтетический Command-drag от точки захвата до точки сброса
    async fn perform(&self, clock: &dyn Clock, plan: DragPlan) -> Result<()> {
        let original = blocking(&self.input, |input| input.cursor_position()).await?;
        {
            let mut hold = self.hold.lock();
            hold.restore_to = Some(original);
            hold.last_position = Some(original);
        }

        debug_if_enabled!("Drag {} -> {} за {} шагов", plan.grab, plan.drop, plan.steps);

        self.post(SyntheticEvent::MouseMoved(plan.grab)).await?;
        self.hide_cursor().await?;
        self.post(SyntheticEvent::ModifierDown(plan.modifier)).await?;
        self.post(SyntheticEvent::MouseDown(plan.grab)).await?;
        clock.sleep(plan.press_hold).await;

        let interval = plan.step_interval();
        for step in 1..=plan.steps {
            let t = f64::from(step) / f64::from(plan.steps);
            let point = plan.grab.lerp(plan.drop, t);
            trace_if_enabled!("Drag шаг {}/{}: {}", step, plan.steps, point);
            self.post(SyntheticEvent::MouseDragged(point)).await?;
            clock.sleep(interval).await;
        }

        self.post(SyntheticEvent::MouseUp(plan.drop)).await?;
        self.post(SyntheticEvent::ModifierUp(plan.modifier)).await?;
        clock.sleep(plan.drop_settle).await;
        Ok(())
    }

    async fn release(&self) {
        let release = self.hold.lock().take_release();
        if let Some(release) = release {
            if let Err(e) = blocking(&self.input, move |input| {
                release.apply(input);
                Ok(())
            })
            .await
            {
                error!("Отпускание ввода после жеста: {}", e);
            }
        }
    }
}

/// Запустить жест на отдельной задаче и ждать не дольше `deadline`.
///
/// Сам жест получает `deadline - release_grace`. По его истечении задача
/// отменяется без ожидания (зависшая отправка события может так и не
/// вернуться), а отпускание кнопки, модификатора и курсора выполняется
/// отдельно и тоже ограничено `release_grace`.
pub async fn run_with_deadline(
    input: Arc<dyn InputSynthesizer>,
    clock: Arc<dyn Clock>,
    plan: DragPlan,
    deadline: Duration,
) -> Result<()> {
    let hold = Arc::new(Mutex::new(InputHold::new(plan.modifier)));
    let gesture_budget = deadline.saturating_sub(plan.release_grace);

    let task_input = Arc::clone(&input);
    let task_hold = Arc::clone(&hold);
    let mut handle = tokio::spawn(async move {
        let _guard = HoldGuard {
            input: Arc::clone(&task_input),
            hold: Arc::clone(&task_hold),
        };
        let gesture = Gesture {
            input: task_input,
            hold: task_hold,
        };
        let result = gesture.perform(clock.as_ref(), plan).await;
        gesture.release().await;
        result
    });

    match tokio::time::timeout(gesture_budget, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(tray_error!(internal, "задача drag завершилась аварийно: {}", join_error)),
        Err(_) => {
            let release = {
                let mut hold = hold.lock();
                hold.abandoned = true;
                hold.take_release()
            };
            handle.abort();

            if let Some(release) = release {
                let released = tokio::time::timeout(
                    plan.release_grace,
                    blocking(&input, move |input| {
                        release.apply(input);
                        Ok(())
                    }),
                )
                .await;
                match released {
                    Ok(Ok(())) => info!("Drag превысил дедлайн {}мс, ввод освобождён", deadline.as_millis()),
                    Ok(Err(e)) => error!("Отпускание ввода после таймаута: {}", e),
                    Err(_) => error!(
                        "Отпускание ввода не уложилось в {}мс, продолжается в фоне",
                        plan.release_grace.as_millis()
                    ),
                }
            }
            Err(tray_error!(timeout, "drag не уложился в {}мс", deadline.as_millis()))
        }
    }
}
