//! Fixed curve styling per plot slot.
//!
//! Slot 0 is the most recent run and sits on top; older runs stack underneath in
//! order. The derivative curve has its own slot just below the newest run.

use serde::{Deserialize, Serialize};

/// Number of run slots.
pub const RUN_SLOTS: usize = 10;

/// Index of the derivative slot.
pub const DERIVATIVE_SLOT: usize = RUN_SLOTS;

/// Named curve colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlotColor {
    /// Slot 0.
    Blue,
    /// Slot 1.
    Red,
    /// Slot 2.
    Green,
    /// Slot 3.
    Orange,
    /// Slot 4.
    Pink,
    /// Slot 5.
    Brown,
    /// Slot 6.
    DarkCyan,
    /// Slot 7.
    Violet,
    /// Slot 8.
    DarkBlue,
    /// Slot 9.
    Gray,
    /// Derivative.
    DarkBrown,
}

impl PlotColor {
    /// sRGB components.
    pub fn rgb(self) -> [u8; 3] {
        match self {
            PlotColor::Blue => [0, 0, 255],
            PlotColor::Red => [255, 0, 0],
            PlotColor::Green => [0, 128, 0],
            PlotColor::Orange => [255, 165, 0],
            PlotColor::Pink => [255, 105, 180],
            PlotColor::Brown => [165, 42, 42],
            PlotColor::DarkCyan => [0, 139, 139],
            PlotColor::Violet => [238, 130, 238],
            PlotColor::DarkBlue => [0, 0, 139],
            PlotColor::Gray => [128, 128, 128],
            PlotColor::DarkBrown => [101, 67, 33],
        }
    }
}

/// Color and stacking of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStyle {
    /// Curve color.
    pub color: PlotColor,
    /// Higher draws on top.
    pub z_order: i32,
}

/// Slot styles, owned by the pipeline and passed to whoever needs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    styles: [SlotStyle; RUN_SLOTS + 1],
}

impl Default for Palette {
    fn default() -> Self {
        Self::standard()
    }
}

impl Palette {
    /// The beamline's standard table.
    pub fn standard() -> Self {
        let style = |color, z_order| SlotStyle { color, z_order };
        Self {
            styles: [
                style(PlotColor::Blue, 30),
                style(PlotColor::Red, 8),
                style(PlotColor::Green, 7),
                style(PlotColor::Orange, 6),
                style(PlotColor::Pink, 5),
                style(PlotColor::Brown, 4),
                style(PlotColor::DarkCyan, 3),
                style(PlotColor::Violet, 2),
                style(PlotColor::DarkBlue, 1),
                style(PlotColor::Gray, 0),
                style(PlotColor::DarkBrown, 9),
            ],
        }
    }

    /// Style of run slot `index`; indices past the last run slot reuse it.
    pub fn run_slot(&self, index: usize) -> SlotStyle {
        self.styles[index.min(RUN_SLOTS - 1)]
    }

    /// Style of the derivative curve.
    pub fn derivative(&self) -> SlotStyle {
        self.styles[DERIVATIVE_SLOT]
    }
}

/// Curve name of run slot `index`.
pub fn slot_name(index: usize) -> String {
    format!("Data {index}")
}

/// Curve name of the derivative.
pub const DERIVATIVE_NAME: &str = "derivative";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_run_on_top_then_derivative() {
        let palette = Palette::standard();
        let newest = palette.run_slot(0);
        let derivative = palette.derivative();
        assert_eq!(newest.color, PlotColor::Blue);
        assert_eq!(derivative.color, PlotColor::DarkBrown);
        assert!(newest.z_order > derivative.z_order);
        for i in 1..RUN_SLOTS {
            assert!(derivative.z_order > palette.run_slot(i).z_order);
        }
        assert_eq!(palette.run_slot(9).z_order, 0);
        assert_eq!(palette.run_slot(42), palette.run_slot(9));
    }

    #[test]
    fn test_slot_names() {
        assert_eq!(slot_name(3), "Data 3");
    }
}
