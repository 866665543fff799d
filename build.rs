fn main() {
    // Rebuild if the path-tracing kernel changes
    println!("cargo:rerun-if-changed=shaders/main.wgsl");
}
