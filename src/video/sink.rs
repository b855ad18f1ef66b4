use tracing::debug;

use crate::video::FrameBuffer;

/// A client-provided render target wrapping a platform texture.
///
/// The host calls `reconfigure` when the frame geometry changes, then
/// `lock` / `post` around each blit. Implementations are platform glue
/// (an Android native window, an SDL texture, a test buffer).
pub trait Surface: Send {
    fn reconfigure(&mut self, width: u32, height: u32);

    /// Lock the backing buffer for writing. `None` skips this blit.
    fn lock(&mut self) -> Option<SurfaceBuffer<'_>>;

    /// Present the previously locked buffer.
    fn post(&mut self);
}

/// A locked destination: RGBA pixels and the row stride in pixels, which
/// may exceed the configured width.
pub struct SurfaceBuffer<'a> {
    pub pixels: &'a mut [u32],
    pub stride: usize,
}

/// The attach/blit/detach side of the zero-copy path.
///
/// Lives behind a single mutex: holding it across the whole blit is what
/// guarantees no blit is in flight when the client detaches and frees the
/// underlying window.
pub(crate) struct SurfaceSlot {
    surface: Option<Box<dyn Surface>>,
    width: u32,
    height: u32,
}

impl SurfaceSlot {
    pub fn new() -> Self {
        Self {
            surface: None,
            width: 0,
            height: 0,
        }
    }

    pub fn attach(&mut self, surface: Box<dyn Surface>, width: u32, height: u32) {
        self.surface = Some(surface);
        self.width = width;
        self.height = height;
        debug!(width, height, "surface attached");
    }

    /// The caller drops the returned box *after* releasing the slot's lock.
    pub fn detach(&mut self) -> Option<Box<dyn Surface>> {
        self.width = 0;
        self.height = 0;
        self.surface.take()
    }

    pub fn blit(&mut self, frame: &FrameBuffer) {
        let (width, height) = (frame.width() as u32, frame.height() as u32);
        if width == 0 || height == 0 {
            return;
        }

        let Some(surface) = self.surface.as_mut() else {
            return;
        };

        if (width, height) != (self.width, self.height) {
            surface.reconfigure(width, height);
            self.width = width;
            self.height = height;
        }

        let Some(dst) = surface.lock() else {
            return;
        };

        let src = frame.pixels();
        let width = width as usize;

        if dst.stride == width {
            let n = src.len().min(dst.pixels.len());
            dst.pixels[..n].copy_from_slice(&src[..n]);
        } else {
            for (src_row, dst_row) in src
                .chunks_exact(width)
                .zip(dst.pixels.chunks_mut(dst.stride))
            {
                dst_row[..width].copy_from_slice(src_row);
            }
        }

        surface.post();
    }
}

/// Fallback display path: the scheduler copies the canonical frame here at
/// each display signal; the client reads it at leisure. Pitch equals width.
pub(crate) struct Snapshot {
    px: Vec<u32>,
    width: usize,
    height: usize,
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            px: Vec::new(),
            width: 0,
            height: 0,
        }
    }

    pub fn copy_from(&mut self, frame: &FrameBuffer) {
        self.width = frame.width();
        self.height = frame.height();
        self.px.clear();
        self.px.extend_from_slice(frame.pixels());
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[u32] {
        &self.px
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::PaletteConfig;
    use libretro_sys::PixelFormat;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct TestSurface {
        px: Vec<u32>,
        stride: usize,
        published: Arc<Mutex<Vec<u32>>>,
        posts: Arc<AtomicU32>,
    }

    impl TestSurface {
        fn boxed(stride: usize) -> (Box<Self>, Arc<Mutex<Vec<u32>>>, Arc<AtomicU32>) {
            let published = Arc::new(Mutex::new(Vec::new()));
            let posts = Arc::new(AtomicU32::new(0));
            let surface = Box::new(Self {
                px: Vec::new(),
                stride,
                published: published.clone(),
                posts: posts.clone(),
            });

            (surface, published, posts)
        }
    }

    impl Surface for TestSurface {
        fn reconfigure(&mut self, _width: u32, height: u32) {
            self.px = vec![0; self.stride * height as usize];
        }

        fn lock(&mut self) -> Option<SurfaceBuffer<'_>> {
            Some(SurfaceBuffer {
                pixels: &mut self.px,
                stride: self.stride,
            })
        }

        fn post(&mut self) {
            *self.published.lock() = self.px.clone();
            self.posts.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn frame_2x2() -> FrameBuffer {
        let mut frame = FrameBuffer::new();
        let mut src = Vec::new();
        for px in [0x0011_2233u32, 0x0044_5566, 0x0077_8899, 0x00AA_BBCC] {
            src.extend_from_slice(&px.to_le_bytes());
        }
        frame
            .convert(
                &src,
                2,
                2,
                8,
                PixelFormat::ARGB8888,
                &PaletteConfig::disabled(),
            )
            .unwrap();
        frame
    }

    #[test]
    fn blit_without_surface_is_a_no_op() {
        let mut slot = SurfaceSlot::new();
        slot.blit(&frame_2x2());
        assert!(slot.detach().is_none());
    }

    #[test]
    fn blit_reconfigures_on_geometry_change_and_posts() {
        let (surface, published, posts) = TestSurface::boxed(2);
        let mut slot = SurfaceSlot::new();
        slot.attach(surface, 0, 0);

        let frame = frame_2x2();
        slot.blit(&frame);
        slot.blit(&frame);

        assert_eq!(posts.load(Ordering::Relaxed), 2);
        assert_eq!(slot.width, 2);
        assert_eq!(slot.height, 2);
        assert_eq!(&*published.lock(), frame.pixels());
    }

    #[test]
    fn strided_blit_fills_each_row() {
        let (surface, published, _posts) = TestSurface::boxed(5);
        let mut slot = SurfaceSlot::new();
        slot.attach(surface, 0, 0);

        let frame = frame_2x2();
        slot.blit(&frame);

        let out = published.lock();
        assert_eq!(&out[0..2], &frame.pixels()[0..2]);
        assert_eq!(&out[5..7], &frame.pixels()[2..4]);
    }

    #[test]
    fn snapshot_mirrors_the_frame() {
        let frame = frame_2x2();
        let mut snapshot = Snapshot::new();

        snapshot.copy_from(&frame);

        assert_eq!(snapshot.width(), 2);
        assert_eq!(snapshot.height(), 2);
        assert_eq!(snapshot.pixels(), frame.pixels());
    }
}
