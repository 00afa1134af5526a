use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// A point in window or screen coordinates
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    /// horizontal coordinate
    pub x: i32,
    /// vertical coordinate
    pub y: i32,
}

impl Point {
    /// Create a new point
    #[inline]
    pub const fn new(x: i32, y: i32) -> Point {
        Point { x, y }
    }

    /// Chebyshev distance to another point, used for click-slop tests
    pub fn chebyshev_distance(&self, other: &Point) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }
}

impl Add for Point {
    type Output = Point;
    #[inline]
    fn add(self, other: Point) -> Point {
        Point::new(self.x + other.x, self.y + other.y)
    }
}

impl AddAssign for Point {
    #[inline]
    fn add_assign(&mut self, other: Point) {
        *self = *self + other;
    }
}

impl Sub for Point {
    type Output = Point;
    #[inline]
    fn sub(self, other: Point) -> Point {
        Point::new(self.x - other.x, self.y - other.y)
    }
}

impl SubAssign for Point {
    #[inline]
    fn sub_assign(&mut self, other: Point) {
        *self = *self - other;
    }
}

impl From<(i32, i32)> for Point {
    #[inline]
    fn from((x, y): (i32, i32)) -> Point {
        Point::new(x, y)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A two-dimensional extent
///
/// Sizes are never negative; constructors clamp.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
    /// width
    pub w: i32,
    /// height
    pub h: i32,
}

impl Size {
    /// Create a new size, clamping negative components to zero
    #[inline]
    pub fn new(w: i32, h: i32) -> Size {
        Size {
            w: w.max(0),
            h: h.max(0),
        }
    }

    /// Returns true if either dimension is zero
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

impl From<(i32, i32)> for Size {
    #[inline]
    fn from((w, h): (i32, i32)) -> Size {
        Size::new(w, h)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.w, self.h)
    }
}

/// An axis-aligned rectangle with integer coordinates
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rectangle {
    /// top-left corner
    pub loc: Point,
    /// extent
    pub size: Size,
}

impl Rectangle {
    /// Create a rectangle from its top-left corner and extent
    #[inline]
    pub fn new(loc: impl Into<Point>, size: impl Into<Size>) -> Rectangle {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Returns true if the rectangle covers no area
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    /// Returns true if the given point lies inside this rectangle
    pub fn contains(&self, point: impl Into<Point>) -> bool {
        let point = point.into();
        point.x >= self.loc.x
            && point.x < self.loc.x + self.size.w
            && point.y >= self.loc.y
            && point.y < self.loc.y + self.size.h
    }

    /// Smallest rectangle covering both `self` and `other`
    ///
    /// An empty rectangle is the identity element.
    pub fn merge(self, other: Rectangle) -> Rectangle {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let x1 = self.loc.x.min(other.loc.x);
        let y1 = self.loc.y.min(other.loc.y);
        let x2 = (self.loc.x + self.size.w).max(other.loc.x + other.size.w);
        let y2 = (self.loc.y + self.size.h).max(other.loc.y + other.size.h);
        Rectangle::new((x1, y1), (x2 - x1, y2 - y1))
    }

    /// Returns true if the two rectangles overlap
    pub fn overlaps(&self, other: &Rectangle) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.loc.x < other.loc.x + other.size.w
            && other.loc.x < self.loc.x + self.size.w
            && self.loc.y < other.loc.y + other.size.h
            && other.loc.y < self.loc.y + self.size.h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chebyshev_is_symmetric() {
        let a = Point::new(10, 10);
        let b = Point::new(13, 8);
        assert_eq!(a.chebyshev_distance(&b), 3);
        assert_eq!(b.chebyshev_distance(&a), 3);
    }

    #[test]
    fn contains_excludes_far_edges() {
        let rect = Rectangle::new((10, 10), (20, 20));
        assert!(rect.contains((10, 10)));
        assert!(rect.contains((29, 29)));
        assert!(!rect.contains((30, 10)));
        assert!(!rect.contains((9, 10)));
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let rect = Rectangle::new((5, 5), (10, 10));
        assert_eq!(rect.merge(Rectangle::default()), rect);
        assert_eq!(Rectangle::default().merge(rect), rect);
    }

    #[test]
    fn merge_covers_both() {
        let a = Rectangle::new((0, 0), (10, 10));
        let b = Rectangle::new((20, 5), (5, 30));
        let merged = a.merge(b);
        assert_eq!(merged, Rectangle::new((0, 0), (25, 35)));
        assert!(merged.overlaps(&a) && merged.overlaps(&b));
    }

    #[test]
    fn negative_sizes_clamp() {
        assert!(Size::new(-4, 10).is_empty());
        assert_eq!(Size::new(-4, 10).w, 0);
    }
}
