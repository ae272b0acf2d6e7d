fn main() {
    // Only link the external operator library when the `link` feature is enabled.
    #[cfg(feature = "link")]
    {
        use std::env;

        if let Ok(dir) = env::var("OPK_LIB_DIR") {
            println!("cargo:rustc-link-search=native={dir}");
        }
        let kind = env::var("OPK_LINK_KIND").unwrap_or_else(|_| "dylib".to_string());
        println!("cargo:rustc-link-lib={kind}=opk");

        println!("cargo:rerun-if-env-changed=OPK_LIB_DIR");
        println!("cargo:rerun-if-env-changed=OPK_LINK_KIND");
    }
}
