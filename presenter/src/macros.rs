macro_rules! value_builder {
    ($fn:ident, $type:ty) => {
        #[inline]
        pub fn $fn(mut self, $fn: $type) -> Self {
            self.$fn = $fn;
            self
        }
    };
}
