use serde_derive::{Deserialize, Serialize};
use std::marker::PhantomData;

pub trait BBoxFormat: std::fmt::Debug {}

/// Left-top-width-height format, contains left top corner and width-height
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct Ltwh;
impl BBoxFormat for Ltwh {}

/// Left-top-right-bottom format, contains left top and right bottom corners
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct Ltrb;
impl BBoxFormat for Ltrb {}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BBox<F: BBoxFormat + serde::Serialize + serde::Deserialize<'static> + PartialEq>(
    [f32; 4],
    PhantomData<F>,
);

impl BBox<Ltwh> {
    #[inline]
    pub fn ltwh(x1: f32, x2: f32, x3: f32, x4: f32) -> Self {
        BBox([x1, x2, x3, x4], Default::default())
    }

    /// Box of a ground-anchored target: `(cx, bottom)` is the bottom-center
    /// point, the box extends `height` upwards. Both sides are shrunk to
    /// `factor` of their size around the same center.
    pub fn ground_anchored(cx: f32, bottom: f32, width: f32, height: f32, factor: f32) -> Self {
        let left = cx - width / 2.0 + (1.0 - factor) * (width / 2.0);
        let top = bottom - height + (1.0 - factor) * (height / 2.0);

        Self::ltwh(left, top, width * factor, height * factor)
    }

    #[inline(always)]
    pub fn left(&self) -> f32 {
        self.0[0]
    }

    #[inline(always)]
    pub fn top(&self) -> f32 {
        self.0[1]
    }

    #[inline(always)]
    pub fn width(&self) -> f32 {
        self.0[2]
    }

    #[inline(always)]
    pub fn height(&self) -> f32 {
        self.0[3]
    }

    /// Touching edges count as overlapping.
    pub fn overlaps(&self, other: &BBox<Ltwh>) -> bool {
        !(self.left() + self.width() < other.left()
            || other.left() + other.width() < self.left()
            || self.top() + self.height() < other.top()
            || other.top() + other.height() < self.top())
    }
}

impl BBox<Ltrb> {
    #[inline]
    pub fn ltrb(x1: f32, x2: f32, x3: f32, x4: f32) -> Self {
        BBox([x1, x2, x3, x4], Default::default())
    }

    #[inline]
    pub fn as_ltwh(&self) -> BBox<Ltwh> {
        self.into()
    }

    /// Component-wise `3:1` blend of `self` (history) with `next`.
    pub fn blend(&self, next: &BBox<Ltrb>) -> Self {
        let mut out = [0.0; 4];

        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(next.0.iter())) {
            *o = (a * 3.0 + b) / 4.0;
        }

        BBox(out, Default::default())
    }
}

impl Default for BBox<Ltrb> {
    fn default() -> Self {
        Self::ltrb(0.0, 0.0, 0.0, 0.0)
    }
}

impl<'a> From<&'a BBox<Ltrb>> for BBox<Ltwh> {
    #[inline]
    fn from(v: &'a BBox<Ltrb>) -> Self {
        Self(
            [v.0[0], v.0[1], v.0[2] - v.0[0], v.0[3] - v.0[1]],
            Default::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shrunk_boxes_overlap_only_when_close() {
        let a = BBox::ground_anchored(100.0, 200.0, 40.0, 100.0, 0.8);
        let b = BBox::ground_anchored(120.0, 200.0, 40.0, 100.0, 0.8);
        let c = BBox::ground_anchored(200.0, 200.0, 40.0, 100.0, 0.8);

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn blend_weights_history_three_to_one() {
        let a = BBox::ltrb(0.0, 0.0, 4.0, 8.0);
        let b = BBox::ltrb(4.0, 4.0, 8.0, 12.0);
        let m = a.blend(&b);

        assert_eq!(m, BBox::ltrb(1.0, 1.0, 5.0, 9.0));

        let ltwh = m.as_ltwh();
        assert_eq!((ltwh.left(), ltwh.top()), (1.0, 1.0));
        assert_eq!((ltwh.width(), ltwh.height()), (4.0, 8.0));
    }
}
