use crate::bbox::{BBox, Ltwh};
use crate::frame::Frame;

/// Maps a person crop to a known external identity (e.g. by face recognition).
pub trait IdentityResolver: Send + Sync {
    fn identify(&self, frame: &Frame, bbox: &BBox<Ltwh>) -> Option<String>;
}

/// Resolver that never recognizes anybody.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResolver;

impl IdentityResolver for NullResolver {
    #[inline]
    fn identify(&self, _frame: &Frame, _bbox: &BBox<Ltwh>) -> Option<String> {
        None
    }
}

/// Adapts a closure backed by some external recognition service.
pub struct ExternalResolver<F> {
    identify: F,
}

impl<F> ExternalResolver<F>
where
    F: Fn(&Frame, &BBox<Ltwh>) -> Option<String> + Send + Sync,
{
    pub fn new(identify: F) -> Self {
        Self { identify }
    }
}

impl<F> IdentityResolver for ExternalResolver<F>
where
    F: Fn(&Frame, &BBox<Ltwh>) -> Option<String> + Send + Sync,
{
    fn identify(&self, frame: &Frame, bbox: &BBox<Ltwh>) -> Option<String> {
        (self.identify)(frame, bbox).filter(|name| !name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::RgbImage;

    #[test]
    fn external_resolver_ignores_empty_names() {
        let frame = Frame::new(RgbImage::new(4, 4), Utc::now());
        let resolver = ExternalResolver::new(|_: &Frame, bbox: &BBox<Ltwh>| {
            if bbox.left() < 10.0 {
                Some("alice".to_string())
            } else {
                Some(String::new())
            }
        });

        assert_eq!(
            resolver.identify(&frame, &BBox::ltwh(0.0, 0.0, 5.0, 5.0)),
            Some("alice".to_string())
        );
        assert_eq!(resolver.identify(&frame, &BBox::ltwh(20.0, 0.0, 5.0, 5.0)), None);
        assert_eq!(NullResolver.identify(&frame, &BBox::ltwh(0.0, 0.0, 5.0, 5.0)), None);
    }
}
