use crate::model::{Hardware, Media, MediaFormat, MediaInterface, MediaType, Nic};
use std::path::Path;

/// Builds the exact QEMU command line for one VM launch.
///
/// Every argument's shape is fixed by the host-side invariants this daemon
/// enforces elsewhere (TAP naming, VNC display, QMP socket path) — this is a
/// pure function of its inputs so it can be unit tested without a QEMU
/// binary present.
pub fn build_argv(
    vm_name: &str,
    vm_id: i64,
    hardware: &Hardware,
    qmp_socket: &Path,
) -> Vec<String> {
    let mut args = Vec::new();

    args.push("-monitor".into());
    args.push("none".into());
    args.push("-serial".into());
    args.push("null".into());
    args.push("-enable-kvm".into());
    args.push("-cpu".into());
    args.push("host".into());
    args.push("-name".into());
    args.push(vm_name.to_string());
    args.push("-vnc".into());
    args.push(crate::vnc::vnc_arg(vm_id));
    args.push("-qmp".into());
    args.push(format!("unix:{},server,nowait", qmp_socket.display()));
    args.push("-m".into());
    args.push(hardware.ram_m.to_string());
    args.push("-smp".into());
    args.push(hardware.cpus.to_string());
    args.push("-boot".into());
    args.push(hardware.boot.to_string());
    args.push("-rtc".into());
    args.push(format!(
        "base={}",
        if hardware.rtc_utc { "utc" } else { "localtime" }
    ));

    for media in &hardware.media {
        args.push("-drive".into());
        args.push(media_drive_arg(media));
    }

    for nic in &hardware.nics {
        let (netdev, device) = nic_args(vm_name, nic);
        args.push("-netdev".into());
        args.push(netdev);
        args.push("-device".into());
        args.push(device);
    }

    args
}

fn media_drive_arg(media: &Media) -> String {
    let kind = match media.kind {
        MediaType::Disk => "disk",
        MediaType::Cdrom => "cdrom",
    };
    let format = match media.format {
        MediaFormat::Raw => "raw",
        MediaFormat::Qcow2 => "qcow2",
    };
    let iface = match media.interface {
        MediaInterface::Virtio => "virtio",
        MediaInterface::Ide => "ide",
        MediaInterface::Floppy => "floppy",
    };
    let cache = if media.host_cache { "writeback" } else { "none" };
    let readonly = if media.readonly { "on" } else { "off" };
    // QEMU's `-drive` option list uses ',' as a separator; a literal comma in
    // a value is escaped by doubling it.
    let escaped_path = media.path.replace(',', ",,");

    format!(
        "media={kind},format={format},file={escaped_path},read-only={readonly},if={iface},cache={cache}"
    )
}

fn nic_args(vm_name: &str, nic: &Nic) -> (String, String) {
    let ifname = crate::net::TapManager::device_name(nic.id);
    let netdev_id = format!("{vm_name}net{}", nic.id);
    let netdev = format!("tap,id={netdev_id},ifname={ifname},script=no,downscript=no");
    let device = format!(
        "{},netdev={netdev_id},mac={}",
        nic.model.qemu_name(),
        nic.mac
    );
    (netdev, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MediaInterface, NicModel};
    use std::path::PathBuf;
    use uuid::Uuid;

    fn hardware() -> Hardware {
        Hardware {
            ram_m: 512,
            cpus: 2,
            boot: 'd',
            rtc_utc: true,
            product_uuid: Uuid::nil(),
            nics: vec![Nic {
                id: 3,
                model: NicModel::VirtioNet,
                mac: "52:54:00:12:34:56".into(),
                master: "br0".into(),
                mtu: 1500,
            }],
            media: vec![Media {
                id: 1,
                kind: MediaType::Cdrom,
                path: "/iso/x,y.iso".into(),
                format: MediaFormat::Raw,
                readonly: true,
                interface: MediaInterface::Ide,
                host_cache: false,
            }],
        }
    }

    #[test]
    fn escapes_commas_in_media_path() {
        let hw = hardware();
        let argv = build_argv("demo", 7, &hw, &PathBuf::from("/run/mmvmm/internal/qmp_x.sock"));
        let drive = argv.iter().find(|a| a.starts_with("media=")).unwrap();
        assert!(drive.contains("file=/iso/x,,y.iso"));
    }

    #[test]
    fn nic_uses_deterministic_tap_name() {
        let hw = hardware();
        let argv = build_argv("demo", 7, &hw, &PathBuf::from("/run/mmvmm/internal/qmp_x.sock"));
        let netdev = argv.iter().find(|a| a.starts_with("tap,")).unwrap();
        assert!(netdev.contains("ifname=mmvmm3"));
    }

    #[test]
    fn vnc_display_is_vm_id() {
        let hw = hardware();
        let argv = build_argv("demo", 7, &hw, &PathBuf::from("/run/mmvmm/internal/qmp_x.sock"));
        let idx = argv.iter().position(|a| a == "-vnc").unwrap();
        assert_eq!(argv[idx + 1], ":7");
    }
}
