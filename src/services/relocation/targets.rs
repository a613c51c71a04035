use crate::config::RelocationConfig;
use crate::error::Result;
use crate::events::{BoundarySnapshot, Zone};
use crate::tray_error;

/// Экранные координаты границ, пригодные для расчёта точки сброса
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedBoundaries {
    pub hidden_x: f64,
    pub always_hidden_x: Option<f64>,
    pub anchor_x: Option<f64>,
}

impl ResolvedBoundaries {
    pub fn from_snapshot(snapshot: &BoundarySnapshot) -> Option<Self> {
        snapshot.hidden_x().map(|hidden_x| Self {
            hidden_x,
            always_hidden_x: snapshot.always_hidden_x(),
            anchor_x: snapshot.anchor_x.filter(|x| x.is_finite() && *x >= 0.0),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetPolicy {
    pub offset_floor: f64,
    pub offset_padding: f64,
    pub anchor_gap: f64,
}

impl TargetPolicy {
    pub fn from_config(config: &RelocationConfig) -> Self {
        Self {
            offset_floor: config.hidden_offset_floor,
            offset_padding: config.hidden_offset_padding,
            anchor_gap: config.anchor_gap,
        }
    }

    /// Отступ за границу растёт с шириной иконки, у узких есть нижний предел
    pub fn hidden_offset(&self, item_width: f64) -> f64 {
        self.offset_floor.max(item_width + self.offset_padding)
    }

    pub fn target_x(&self, item_width: f64, zone: Zone, boundaries: &ResolvedBoundaries) -> Result<f64> {
        let offset = self.hidden_offset(item_width);
        match zone {
            Zone::Hidden => {
                let target = boundaries.hidden_x - offset;
                // Не проталкиваем иконку за маркер всегда скрытой зоны: середина
                // промежутка между маркерами оставляет место и широким иконкам
                match boundaries.always_hidden_x {
                    Some(always_hidden) if target <= always_hidden => {
                        Ok((always_hidden + boundaries.hidden_x) / 2.0)
                    }
                    _ => Ok(target),
                }
            }
            Zone::AlwaysHidden => boundaries
                .always_hidden_x
                .map(|always_hidden| always_hidden - offset)
                .ok_or_else(|| tray_error!(geometry, "граница всегда скрытой зоны недоступна")),
            Zone::Visible => match boundaries.anchor_x {
                // Сразу правее границы: соседей раздвигает сама система
                Some(anchor) => Ok((boundaries.hidden_x + 1.0).max(anchor - self.anchor_gap)),
                None => Ok(boundaries.hidden_x + offset),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> TargetPolicy {
        TargetPolicy::from_config(&RelocationConfig::default())
    }

    fn boundaries(hidden_x: f64, always_hidden_x: Option<f64>, anchor_x: Option<f64>) -> ResolvedBoundaries {
        ResolvedBoundaries {
            hidden_x,
            always_hidden_x,
            anchor_x,
        }
    }

    #[test]
    fn offset_scales_with_width() {
        assert_eq!(policy().hidden_offset(16.0), 36.0);
        assert_eq!(policy().hidden_offset(200.0), 220.0);
        assert_eq!(policy().hidden_offset(4.0), 30.0);
    }

    #[test]
    fn hidden_target_is_left_of_boundary() {
        let target = policy().target_x(16.0, Zone::Hidden, &boundaries(500.0, None, None)).unwrap();
        assert_eq!(target, 464.0);
        let wide = policy().target_x(200.0, Zone::Hidden, &boundaries(500.0, None, None)).unwrap();
        assert_eq!(wide, 280.0);
    }

    #[test]
    fn hidden_target_does_not_cross_always_hidden_marker() {
        let target = policy()
            .target_x(22.0, Zone::Hidden, &boundaries(500.0, Some(490.0), None))
            .unwrap();
        assert_eq!(target, 495.0);

        // Широкая иконка: отступ 220 перелетел бы маркер в 40px левее
        let wide = policy()
            .target_x(200.0, Zone::Hidden, &boundaries(500.0, Some(460.0), None))
            .unwrap();
        assert_eq!(wide, 480.0);
        assert!(wide > 460.0 && wide < 500.0);
    }

    #[test]
    fn visible_target_lands_right_of_boundary_flush_anchor() {
        // Маркер и якорь вплотную: старая формула min(boundary+offset, anchor-20) промахивалась
        let target = policy()
            .target_x(22.0, Zone::Visible, &boundaries(500.0, None, Some(501.0)))
            .unwrap();
        assert_eq!(target, 501.0);

        let spaced = policy()
            .target_x(22.0, Zone::Visible, &boundaries(500.0, None, Some(508.0)))
            .unwrap();
        assert_eq!(spaced, 506.0);
    }

    #[test]
    fn always_hidden_target_requires_boundary() {
        let target = policy()
            .target_x(16.0, Zone::AlwaysHidden, &boundaries(500.0, Some(100.0), None))
            .unwrap();
        assert_eq!(target, 64.0);
        assert!(policy()
            .target_x(16.0, Zone::AlwaysHidden, &boundaries(500.0, None, None))
            .is_err());
    }
}
