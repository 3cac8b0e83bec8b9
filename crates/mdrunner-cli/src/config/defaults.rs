pub struct DefaultsConfig {
    pub checkpoint_output: &'static str,
    pub checkpoint_period_minutes: f64,
    pub append: bool,
    pub matrix_output: &'static str,
    pub long_range_ranks: i64,
    pub gpu_policy: &'static str,
    pub rank_order: &'static str,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            checkpoint_output: "state.cpt",
            checkpoint_period_minutes: 15.0,
            append: true,
            matrix_output: "hessian.mtx",
            long_range_ranks: -1,
            gpu_policy: "auto",
            rank_order: "interleave",
        }
    }
}
