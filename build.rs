use std::{
    collections::BTreeMap,
    io::{BufWriter, Write},
};

fn main() {
    generate_configs();
}

fn generate_configs() {
    #[derive(Debug, Clone, Copy)]
    struct ConfigValue {
        value: usize,
        comment: &'static str,
    }

    const CONFIGS: &[(&str, ConfigValue)] = &[
        ("SB_MAX_SHIFT", ConfigValue {
            value: 4 + 10,
            comment: "The maximal size of a superblock, in bits.",
        }),
        ("PAGE_SHIFT", ConfigValue {
            value: 2 + 10,
            comment: "The page size assumed when the base allocator cannot report one, in bits.",
        }),
        ("DESC_BATCH", ConfigValue {
            value: 64,
            comment: "The number of descriptors reserved at once when the pool runs dry.",
        }),
        ("CLEANUP_BOUND", ConfigValue {
            value: 2,
            comment: "The number of partial descriptors a freeing thread re-publishes before it stops sweeping.",
        }),
        ("RETIRE_THRESHOLD", ConfigValue {
            value: 64,
            comment: "The number of retired nodes that triggers a hazard pointer scan.",
        }),
    ];

    let mut configs = CONFIGS.iter().copied().collect::<BTreeMap<_, _>>();

    for (env, value) in std::env::vars() {
        let Some(name) = env.strip_prefix("LFS_") else {
            continue;
        };
        if let (Some(slot), Ok(value)) = (configs.get_mut(name), value.parse::<usize>()) {
            slot.value = value;
        }
    }
    for name in configs.keys() {
        println!("cargo:rerun-if-env-changed=LFS_{name}");
    }

    let output_dir = std::env::var("OUT_DIR").unwrap();
    let file = std::fs::File::create(format!("{output_dir}/config.rs")).unwrap();
    let mut file = BufWriter::new(file);

    for (name, config) in configs {
        writeln!(
            &mut file,
            "#[doc = \"{}\"] pub const {name}: usize = {};",
            config.comment, config.value
        )
        .unwrap();
    }
}
