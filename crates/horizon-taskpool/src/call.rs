//! Tuple-unpacking calls for the starmap family.
//!
//! Rust has no argument splat, so the starmap operations accept any
//! function whose parameter list matches the element tuple of the input
//! stream through the [`StarCall`] trait. Implementations are provided for
//! `Fn` arities 0 through 8.
//!
//! ```
//! use horizon_taskpool::StarCall;
//!
//! fn add(a: i32, b: i32) -> i32 { a + b }
//! assert_eq!(add.call_star((1, 2)), 3);
//! ```

/// Calls a function with arguments unpacked from a tuple.
pub trait StarCall<Args, Out> {
    /// Invoke the function with the unpacked `args` tuple.
    fn call_star(&self, args: Args) -> Out;
}

macro_rules! impl_star_call {
    ($($arg:ident),*) => {
        impl<Func, Out, $($arg),*> StarCall<($($arg,)*), Out> for Func
        where
            Func: Fn($($arg),*) -> Out,
        {
            #[allow(non_snake_case)]
            fn call_star(&self, ($($arg,)*): ($($arg,)*)) -> Out {
                (self)($($arg),*)
            }
        }
    };
}

impl_star_call!();
impl_star_call!(A1);
impl_star_call!(A1, A2);
impl_star_call!(A1, A2, A3);
impl_star_call!(A1, A2, A3, A4);
impl_star_call!(A1, A2, A3, A4, A5);
impl_star_call!(A1, A2, A3, A4, A5, A6);
impl_star_call!(A1, A2, A3, A4, A5, A6, A7);
impl_star_call!(A1, A2, A3, A4, A5, A6, A7, A8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unary_and_binary_calls() {
        let square = |x: i32| x * x;
        assert_eq!(square.call_star((4,)), 16);

        let add = |a: i32, b: i32| a + b;
        assert_eq!(add.call_star((1, 2)), 3);
    }

    #[test]
    fn nullary_call() {
        let constant = || 7;
        assert_eq!(constant.call_star(()), 7);
    }

    #[test]
    fn mixed_argument_types() {
        let describe = |name: &str, count: usize, flag: bool| format!("{name}:{count}:{flag}");
        assert_eq!(describe.call_star(("jobs", 3, true)), "jobs:3:true");
    }

    #[test]
    fn works_through_iterators() {
        let add = |a: i32, b: i32| a + b;
        let sums: Vec<_> = [(1, 1), (2, 2), (3, 3)]
            .into_iter()
            .map(|args| add.call_star(args))
            .collect();
        assert_eq!(sums, vec![2, 4, 6]);
    }
}
