use tracing::info;

use crate::augment::Grid;

/// 256-color ANSI backgrounds for the ten ARC symbols, in the conventional
/// palette (black, blue, red, green, yellow, grey, fuchsia, orange, azure,
/// maroon).
const COLOR_CODES: [u8; 10] = [16, 27, 196, 46, 226, 245, 201, 208, 45, 88];

/// Everything the training loop reports about one logged step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub epoch: usize,
    pub step: usize,
    pub main_loss: f64,
    pub consistency_loss: f64,
    pub gating_loss: f64,
    pub token_accuracy: f64,
    pub grid_accuracy: f64,
    pub pi: f64,
    pub attn_mean_active: f64,
    pub moe_mean_active: f64,
    pub items_per_sec: f64,
}

/// Console-side view of a training run: structured step and eval lines plus
/// colour renderings of sample grids.
pub struct Observer;

impl Observer {
    pub fn new() -> Self {
        Self
    }

    pub fn log_step(&self, report: &StepReport) {
        info!(
            "E{:03} S{:06} | L {:.4} C {:.4} G {:.4} | Acc T {:.3} G {:.3} | PI {:.4} | K {:.1}/{:.1} | {:.1} it/s",
            report.epoch,
            report.step,
            report.main_loss,
            report.consistency_loss,
            report.gating_loss,
            report.token_accuracy,
            report.grid_accuracy,
            report.pi,
            report.attn_mean_active,
            report.moe_mean_active,
            report.items_per_sec,
        );
    }

    pub fn log_eval(&self, epoch: usize, step: usize, exact_match: f64, samples: usize) {
        info!(
            "E{epoch:03} S{step:06} | eval exact-match {exact_match:.3} over {samples} samples"
        );
    }

    pub fn log_regeneration(&self, layer: &str, regenerated: usize, pool_size: usize) {
        if regenerated > 0 {
            info!("regenerated {regenerated}/{pool_size} dead experts in {layer}");
        }
    }

    /// Render input, target and prediction side by side for one sample.
    pub fn show_sample(&self, input: &Grid, target: &Grid, prediction: &Grid) {
        let rendering = render_side_by_side(&[
            ("input", input),
            ("target", target),
            ("prediction", prediction),
        ]);
        info!("\n{rendering}");
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}

/// One grid as colour-block lines. Symbols outside the colour range (pad,
/// markers) render as a dot placeholder.
pub fn render_grid(grid: &Grid) -> Vec<String> {
    grid.iter()
        .map(|row| {
            let mut line = String::new();
            for &symbol in row {
                match COLOR_CODES.get(symbol as usize) {
                    Some(code) => line.push_str(&format!("\x1b[48;5;{code}m  \x1b[0m")),
                    None => line.push_str(" ·"),
                }
            }
            line
        })
        .collect()
}

fn render_side_by_side(grids: &[(&str, &Grid)]) -> String {
    const GAP: &str = "   ";
    let rendered: Vec<Vec<String>> = grids.iter().map(|(_, g)| render_grid(g)).collect();
    let widths: Vec<usize> = grids
        .iter()
        .map(|(_, g)| g.iter().map(Vec::len).max().unwrap_or(0) * 2)
        .collect();
    let height = rendered.iter().map(Vec::len).max().unwrap_or(0);

    let mut out = String::new();
    for ((label, _), &width) in grids.iter().zip(&widths) {
        out.push_str(&format!("{label:<width$}{GAP}"));
    }
    out.push('\n');
    for line_idx in 0..height {
        for (block, width) in rendered.iter().zip(&widths) {
            match block.get(line_idx) {
                // ANSI escapes make the line wider than its visible width, so
                // pad manually from the cell count.
                Some(line) => {
                    let visible = block_line_cells(line) * 2;
                    out.push_str(line);
                    out.push_str(&" ".repeat(width.saturating_sub(visible)));
                }
                None => out.push_str(&" ".repeat(*width)),
            }
            out.push_str(GAP);
        }
        out.push('\n');
    }
    out
}

fn block_line_cells(line: &str) -> usize {
    line.matches("\x1b[0m").count() + line.matches(" ·").count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendering_covers_every_row_and_colors_cells() {
        let grid = vec![vec![0u32, 1, 2], vec![3, 4, 5]];
        let lines = render_grid(&grid);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("48;5;16m"));
        assert!(lines[0].contains("48;5;196m"));
    }

    #[test]
    fn non_color_symbols_render_as_placeholders() {
        let grid = vec![vec![10u32, 3]];
        let lines = render_grid(&grid);
        assert!(lines[0].starts_with(" ·"));
        assert!(lines[0].contains("48;5;46m"));
    }

    #[test]
    fn side_by_side_layout_handles_uneven_heights() {
        let tall = vec![vec![1u32], vec![2], vec![3]];
        let short = vec![vec![4u32, 5]];
        let out = render_side_by_side(&[("a", &tall), ("b", &short)]);
        // Header plus the taller grid's three lines.
        assert_eq!(out.lines().count(), 4);
        assert!(out.starts_with("a "));
    }
}
