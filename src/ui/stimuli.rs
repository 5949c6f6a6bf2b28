use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Style},
};

use crate::config::ExperimentConfig;
use crate::layout::{Position, PALETTE};

/// Terminal cells are roughly twice as tall as they are wide.
const CELL_ASPECT: f64 = 2.0;

/// Largest rect inside `area` with the abstract stimulus area's proportions,
/// centered.
pub fn fit_field(cfg: &ExperimentConfig, area: Rect) -> Rect {
    if area.width == 0 || area.height == 0 || cfg.area_width <= 0.0 || cfg.area_height <= 0.0 {
        return Rect::new(area.x, area.y, 0, 0);
    }
    let ratio = cfg.area_width / cfg.area_height * CELL_ASPECT;
    let mut width = area.width as f64;
    let mut height = width / ratio;
    if height > area.height as f64 {
        height = area.height as f64;
        width = height * ratio;
    }
    let (width, height) = (width.floor() as u16, height.floor() as u16);
    Rect::new(
        area.x + (area.width - width) / 2,
        area.y + (area.height - height) / 2,
        width,
        height,
    )
}

/// Cell rect of one stimulus inside `field`
pub fn stimulus_rect(cfg: &ExperimentConfig, field: Rect, pos: &Position) -> Rect {
    let sx = field.width as f64 / cfg.area_width;
    let sy = field.height as f64 / cfg.area_height;
    let width = ((cfg.stimulus_size * sx).round() as u16).max(2);
    let height = ((cfg.stimulus_size * sy).round() as u16).max(1);
    let x = field.x + (pos.x * sx).floor() as u16;
    let y = field.y + (pos.y * sy).floor() as u16;
    Rect::new(x, y, width, height).intersection(field)
}

pub fn render_stimuli(
    cfg: &ExperimentConfig,
    layout: &[Position],
    colors: &[usize],
    field: Rect,
    buf: &mut Buffer,
) {
    for (i, pos) in layout.iter().enumerate() {
        let rgb = PALETTE[colors.get(i).copied().unwrap_or(i) % PALETTE.len()];
        let rect = stimulus_rect(cfg, field, pos);
        buf.set_style(rect, Style::default().bg(Color::Rgb(rgb.0, rgb.1, rgb.2)));
    }
}
