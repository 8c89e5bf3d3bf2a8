use embedded_graphics::{
    prelude::{Point, Size},
    primitives::Rectangle,
};

/// An axis-aligned rectangle with integer pixel coordinates.
///
/// Rectangles may extend past the edges of the image they are drawn onto; drawing clips them.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub(crate) rect: Rectangle,
}

impl Rect {
    /// Creates a rectangle spanning two opposite corners, both of which are inside the rectangle.
    ///
    /// The corners may be given in any order.
    pub fn from_corners(a: (i32, i32), b: (i32, i32)) -> Self {
        let (x_min, x_max) = (a.0.min(b.0), a.0.max(b.0));
        let (y_min, y_max) = (a.1.min(b.1), a.1.max(b.1));
        Self {
            rect: Rectangle {
                top_left: Point { x: x_min, y: y_min },
                size: Size {
                    width: (x_max - x_min + 1) as u32,
                    height: (y_max - y_min + 1) as u32,
                },
            },
        }
    }

    /// Returns the X coordinate of the left side of the rectangle.
    #[inline]
    pub fn x(&self) -> i32 {
        self.rect.top_left.x
    }

    /// Returns the Y coordinate of the top side of the rectangle.
    #[inline]
    pub fn y(&self) -> i32 {
        self.rect.top_left.y
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.rect.size.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.rect.size.height
    }

    /// Returns the X coordinate of the right-most column inside the rectangle.
    #[inline]
    pub fn x_max(&self) -> i32 {
        self.x() + self.width() as i32 - 1
    }

    /// Returns the Y coordinate of the bottom-most row inside the rectangle.
    #[inline]
    pub fn y_max(&self) -> i32 {
        self.y() + self.height() as i32 - 1
    }
}

impl std::fmt::Debug for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Rect @ ({},{})-({},{})",
            self.x(),
            self.y(),
            self.x_max(),
            self.y_max(),
        )
    }
}
