/// The smaller of two values. If they are unordered (a NaN is involved) the second is returned,
/// so a limit passed second wins over a NaN demand.
pub fn min_of_2<T: PartialOrd + Copy>(first: T, second: T) -> T {
    if first < second {
        first
    } else {
        second
    }
}

/// The larger of two values, returning the second when they are unordered.
pub fn max_of_2<T: PartialOrd + Copy>(first: T, second: T) -> T {
    if first > second {
        first
    } else {
        second
    }
}
