use easel::Viewport;

/// A column-major 3x3 matrix, as handed to `uniformMatrix3fv`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mat3 {
    /// Column-major coefficients.
    pub data: [f32; 9],
}

impl Mat3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            data: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }

    /// The world-to-clip transform for a viewport over a canvas.
    ///
    /// World coordinates map to screen as `screen = world * scale +
    /// offset`, then to normalized device coordinates with the Y axis
    /// flipped so that world Y grows downward while clip Y grows upward.
    pub fn view(viewport: Viewport, canvas_width: f32, canvas_height: f32) -> Self {
        let scale = viewport.scale as f32;
        let (vx, vy) = (viewport.x as f32, viewport.y as f32);
        let sx = 2.0 * scale / canvas_width;
        let sy = -2.0 * scale / canvas_height;
        let tx = 2.0 * vx / canvas_width - 1.0;
        let ty = 1.0 - 2.0 * vy / canvas_height;
        Self {
            data: [sx, 0.0, 0.0, 0.0, sy, 0.0, tx, ty, 1.0],
        }
    }

    /// Applies the transform to a point (for tests and picking).
    pub fn transform(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.data;
        (m[0] * x + m[3] * y + m[6], m[1] * x + m[4] * y + m[7])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32)) -> bool {
        (a.0 - b.0).abs() < 1e-5 && (a.1 - b.1).abs() < 1e-5
    }

    #[test]
    fn identity_viewport_maps_canvas_corners_to_clip_corners() {
        let m = Mat3::view(Viewport::default(), 800.0, 600.0);
        // world origin is the top-left of the canvas: clip (-1, 1)
        assert!(close(m.transform(0.0, 0.0), (-1.0, 1.0)));
        // world (800, 600) is the bottom-right: clip (1, -1)
        assert!(close(m.transform(800.0, 600.0), (1.0, -1.0)));
        // the canvas center lands on the clip origin
        assert!(close(m.transform(400.0, 300.0), (0.0, 0.0)));
    }

    #[test]
    fn pan_and_zoom_compose() {
        let viewport = Viewport {
            x: 100.0,
            y: 50.0,
            scale: 2.0,
        };
        let m = Mat3::view(viewport, 800.0, 600.0);
        // world (0,0) sits at screen (100, 50)
        let expected = (2.0 * 100.0 / 800.0 - 1.0, 1.0 - 2.0 * 50.0 / 600.0);
        assert!(close(m.transform(0.0, 0.0), expected));
        // one world unit moves two screen pixels
        let a = m.transform(0.0, 0.0);
        let b = m.transform(1.0, 0.0);
        assert!((b.0 - a.0 - 2.0 * 2.0 / 800.0).abs() < 1e-6);
    }
}
