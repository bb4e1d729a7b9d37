//! Internal testing utilities for the rten-export crates.

use std::fmt::Debug;
use std::panic::RefUnwindSafe;

/// Run a table of test cases, reporting every failing case.
///
/// Define a `Debug` struct, conventionally named `Case`, holding the inputs
/// and expected result of one case. Put the cases in any collection and call
/// `test_each` with a closure that checks one case:
///
/// ```
/// use rten_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///     spec: &'static str,
///     rank: usize,
/// }
///
/// let cases = [
///     Case { spec: "4", rank: 1 },
///     Case { spec: "1024x4", rank: 2 },
/// ];
///
/// cases.test_each(|case| {
///     assert_eq!(case.spec.split('x').count(), case.rank);
/// });
/// ```
///
/// Panics in the closure are caught so that the remaining cases still run.
/// Afterwards `test_each` panics with the debug representation of every case
/// that failed.
///
/// Cases and values captured by the closure must be unwind safe. Wrap values
/// with interior mutability in
/// [`AssertUnwindSafe`](std::panic::AssertUnwindSafe), or create them inside
/// the closure.
pub trait TestCases {
    type Case;

    /// Call `test` with a reference to each case.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        I::Item: Debug + RefUnwindSafe,
    {
        let failures: Vec<I::Item> = self
            .into_iter()
            .filter(|case| std::panic::catch_unwind(|| test(case)).is_err())
            .collect();

        if !failures.is_empty() {
            panic!("{} test cases failed: {:?}", failures.len(), failures);
        }
    }
}
