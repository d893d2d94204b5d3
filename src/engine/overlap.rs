use crate::model::Span;

/// Relationship of range A to range B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    None,
    Exact,
    /// A fully encloses B.
    Contains,
    /// B fully encloses A.
    Contained,
    /// Partial overlap, with the shared sub-range.
    Partial(Span),
}

impl Overlap {
    pub fn as_str(&self) -> &'static str {
        match self {
            Overlap::None => "no_overlap",
            Overlap::Exact => "exact_match",
            Overlap::Contains => "contains",
            Overlap::Contained => "contained",
            Overlap::Partial(_) => "overlap",
        }
    }

    pub fn is_overlap(&self) -> bool {
        !matches!(self, Overlap::None)
    }
}

/// Classify two half-open ranges in the same unit.
pub fn classify(a: &Span, b: &Span) -> Overlap {
    if a.end <= b.start || b.end <= a.start {
        return Overlap::None;
    }
    if a.start == b.start && a.end == b.end {
        return Overlap::Exact;
    }
    if a.start <= b.start && a.end >= b.end {
        return Overlap::Contains;
    }
    if b.start <= a.start && b.end >= a.end {
        return Overlap::Contained;
    }
    Overlap::Partial(Span::new(a.start.max(b.start), a.end.min(b.end)))
}

/// The shared sub-range of two ranges, whatever their relationship.
pub fn intersection(a: &Span, b: &Span) -> Option<Span> {
    match classify(a, b) {
        Overlap::None => None,
        Overlap::Exact | Overlap::Contained => Some(*a),
        Overlap::Contains => Some(*b),
        Overlap::Partial(shared) => Some(shared),
    }
}
