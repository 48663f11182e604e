/// Location string for `anyhow` contexts.
macro_rules! context {
    () => {
        format!("{}:{}", file!(), line!())
    };
}
